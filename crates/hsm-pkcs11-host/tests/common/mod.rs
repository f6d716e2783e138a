//! In-process fake token used by the integration tests.
//!
//! The fake exports `extern "C"` entry points with the PKCS#11 prototypes and
//! records every native call in thread-local state, so each test observes only
//! its own module loads.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;

use hsm_pkcs11_host::cryptoki_sys::{
    CK_BBOOL, CK_C_INITIALIZE_ARGS, CK_FLAGS, CK_FUNCTION_LIST, CK_INFO, CK_RV, CK_SLOT_ID,
    CK_ULONG, CK_VERSION, CK_VOID_PTR, CKR_ARGUMENTS_BAD, CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_FUNCTION_NOT_SUPPORTED,
    CKR_OK,
};
use hsm_pkcs11_host::{
    DiscoveryStrategy, ENTRY_POINTS, ModuleError, ModuleLoader, ModuleResult, ModuleSource,
};

pub const FAKE_MODULE_PATH: &str = "/opt/ferrohsm/lib/libfake-token.so";
pub const FAKE_MANUFACTURER: &str = "FerroLabs AG";
pub const FAKE_DESCRIPTION: &str = "FerroHSM Fake Token";
pub const SLOTS_WITH_TOKEN: &[CK_SLOT_ID] = &[1];
pub const ALL_SLOTS: &[CK_SLOT_ID] = &[1, 2];

/// Configurable behaviour of the fake module.
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub export_function_list: bool,
    pub missing_symbols: Vec<&'static str>,
    pub list_version: CK_VERSION,
    pub null_sign_in_list: bool,
    pub null_function_list: bool,
    pub get_function_list_rv: CK_RV,
    pub initialize_rv: CK_RV,
    pub finalize_rv: CK_RV,
    pub fail_unload: bool,
    /// Fill calls of `C_GetSlotList` that report `CKR_BUFFER_TOO_SMALL`.
    pub slot_list_races: usize,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            export_function_list: true,
            missing_symbols: Vec::new(),
            list_version: CK_VERSION {
                major: 2,
                minor: 40,
            },
            null_sign_in_list: false,
            null_function_list: false,
            get_function_list_rv: CKR_OK,
            initialize_rv: CKR_OK,
            finalize_rv: CKR_OK,
            fail_unload: false,
            slot_list_races: 0,
        }
    }
}

/// Native calls observed on the current thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub loads: usize,
    pub unloads: usize,
    pub get_function_list_calls: usize,
    pub initialize_calls: usize,
    pub finalize_calls: usize,
    pub other_calls: usize,
    pub initialized: bool,
    pub last_flags: Option<CK_FLAGS>,
    pub last_mutex_callbacks: bool,
    pub slot_list_races: usize,
}

impl Record {
    pub fn live_modules(&self) -> usize {
        self.loads - self.unloads
    }
}

thread_local! {
    static BEHAVIOUR: RefCell<Behaviour> = RefCell::new(Behaviour::default());
    static RECORD: RefCell<Record> = RefCell::new(Record::default());
    static FUNCTION_LIST: RefCell<Option<Box<CK_FUNCTION_LIST>>> = const { RefCell::new(None) };
}

pub fn record() -> Record {
    RECORD.with(|r| r.borrow().clone())
}

fn behaviour() -> Behaviour {
    BEHAVIOUR.with(|b| b.borrow().clone())
}

fn update(f: impl FnOnce(&mut Record)) {
    RECORD.with(|r| f(&mut r.borrow_mut()));
}

/// Loader handing out fake modules. Creating one resets the thread's record.
#[derive(Debug, Clone, Default)]
pub struct FakeLoader {
    behaviour: Behaviour,
}

impl FakeLoader {
    pub fn new() -> Self {
        RECORD.with(|r| *r.borrow_mut() = Record::default());
        FUNCTION_LIST.with(|l| *l.borrow_mut() = None);
        Self::default()
    }

    pub fn without_symbol(mut self, name: &'static str) -> Self {
        self.behaviour.missing_symbols.push(name);
        self
    }

    pub fn without_function_list(mut self) -> Self {
        self.behaviour.export_function_list = false;
        self
    }

    pub fn with_list_version(mut self, major: u8, minor: u8) -> Self {
        self.behaviour.list_version = CK_VERSION { major, minor };
        self
    }

    pub fn with_null_sign_in_list(mut self) -> Self {
        self.behaviour.null_sign_in_list = true;
        self
    }

    pub fn with_null_function_list(mut self) -> Self {
        self.behaviour.null_function_list = true;
        self
    }

    pub fn failing_get_function_list(mut self, rv: CK_RV) -> Self {
        self.behaviour.get_function_list_rv = rv;
        self
    }

    pub fn failing_initialize(mut self, rv: CK_RV) -> Self {
        self.behaviour.initialize_rv = rv;
        self
    }

    pub fn failing_finalize(mut self, rv: CK_RV) -> Self {
        self.behaviour.finalize_rv = rv;
        self
    }

    pub fn failing_unload(mut self) -> Self {
        self.behaviour.fail_unload = true;
        self
    }

    pub fn with_slot_list_races(mut self, races: usize) -> Self {
        self.behaviour.slot_list_races = races;
        self
    }
}

impl ModuleLoader for FakeLoader {
    fn load(&self, path: &Path) -> ModuleResult<Box<dyn ModuleSource>> {
        BEHAVIOUR.with(|b| *b.borrow_mut() = self.behaviour.clone());
        install_function_list(&self.behaviour)?;

        let mut symbols = full_symbol_map(self.behaviour.export_function_list);
        for name in &self.behaviour.missing_symbols {
            symbols.remove(name);
        }
        update(|r| r.loads += 1);
        Ok(Box::new(FakeModule {
            path: path.to_path_buf(),
            symbols,
            fail_unload: self.behaviour.fail_unload,
        }))
    }
}

struct FakeModule {
    path: PathBuf,
    symbols: HashMap<&'static str, usize>,
    fail_unload: bool,
}

impl ModuleSource for FakeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        self.symbols.get(name).map(|address| *address as *mut c_void)
    }

    fn unload(self: Box<Self>) -> ModuleResult<()> {
        update(|r| r.unloads += 1);
        if self.fail_unload {
            return Err(ModuleError::unload(&self.path, "module still referenced"));
        }
        Ok(())
    }
}

fn full_symbol_map(with_getter: bool) -> HashMap<&'static str, usize> {
    let mut symbols: HashMap<&'static str, usize> = ENTRY_POINTS
        .iter()
        .map(|name| (*name, unsupported as *const () as usize))
        .collect();
    symbols.insert("C_Initialize", fake_initialize as *const () as usize);
    symbols.insert("C_Finalize", fake_finalize as *const () as usize);
    symbols.insert("C_GetInfo", fake_get_info as *const () as usize);
    symbols.insert("C_GetSlotList", fake_get_slot_list as *const () as usize);
    if with_getter {
        symbols.insert(
            "C_GetFunctionList",
            fake_get_function_list as *const () as usize,
        );
    }
    symbols
}

/// Builds the list `C_GetFunctionList` hands out, reusing the library's own
/// symbol resolution over a complete symbol map.
fn install_function_list(behaviour: &Behaviour) -> ModuleResult<()> {
    let complete = FakeModule {
        path: PathBuf::from(FAKE_MODULE_PATH),
        symbols: full_symbol_map(true),
        fail_unload: false,
    };
    let table = DiscoveryStrategy::SymbolLookup.resolve(&complete)?;
    let mut list = *table.as_raw();
    list.version = behaviour.list_version;
    list.C_GetFunctionList = Some(fake_get_function_list);
    if behaviour.null_sign_in_list {
        list.C_Sign = None;
    }
    FUNCTION_LIST.with(|l| *l.borrow_mut() = Some(Box::new(list)));
    Ok(())
}

extern "C" fn unsupported() -> CK_RV {
    update(|r| r.other_calls += 1);
    CKR_FUNCTION_NOT_SUPPORTED
}

unsafe extern "C" fn fake_get_function_list(pp_list: *mut *mut CK_FUNCTION_LIST) -> CK_RV {
    update(|r| r.get_function_list_calls += 1);
    let behaviour = behaviour();
    if behaviour.get_function_list_rv != CKR_OK {
        return behaviour.get_function_list_rv;
    }
    if pp_list.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let list = if behaviour.null_function_list {
        ptr::null_mut()
    } else {
        FUNCTION_LIST.with(|l| {
            l.borrow_mut()
                .as_mut()
                .map_or(ptr::null_mut(), |list| &mut **list as *mut CK_FUNCTION_LIST)
        })
    };
    unsafe {
        *pp_list = list;
    }
    CKR_OK
}

unsafe extern "C" fn fake_initialize(args: CK_VOID_PTR) -> CK_RV {
    let behaviour = behaviour();
    let (flags, callbacks) = if args.is_null() {
        (None, false)
    } else {
        let args = unsafe { *(args as *const CK_C_INITIALIZE_ARGS) };
        (Some(args.flags), args.CreateMutex.is_some())
    };
    let already = record().initialized;
    update(|r| {
        r.initialize_calls += 1;
        r.last_flags = flags;
        r.last_mutex_callbacks = callbacks;
    });
    if already {
        return CKR_CRYPTOKI_ALREADY_INITIALIZED;
    }
    if behaviour.initialize_rv == CKR_OK {
        update(|r| r.initialized = true);
    }
    behaviour.initialize_rv
}

unsafe extern "C" fn fake_finalize(reserved: CK_VOID_PTR) -> CK_RV {
    update(|r| r.finalize_calls += 1);
    if !reserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    if !record().initialized {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    update(|r| r.initialized = false);
    behaviour().finalize_rv
}

unsafe extern "C" fn fake_get_info(info: *mut CK_INFO) -> CK_RV {
    update(|r| r.other_calls += 1);
    if !record().initialized {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    if info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let info = unsafe { &mut *info };
    info.cryptokiVersion = CK_VERSION {
        major: 2,
        minor: 40,
    };
    pad_into(&mut info.manufacturerID, FAKE_MANUFACTURER);
    info.flags = 0;
    pad_into(&mut info.libraryDescription, FAKE_DESCRIPTION);
    info.libraryVersion = CK_VERSION { major: 0, minor: 3 };
    CKR_OK
}

unsafe extern "C" fn fake_get_slot_list(
    token_present: CK_BBOOL,
    slot_list: *mut CK_SLOT_ID,
    count: *mut CK_ULONG,
) -> CK_RV {
    update(|r| r.other_calls += 1);
    if !record().initialized {
        return CKR_CRYPTOKI_NOT_INITIALIZED;
    }
    if count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let slots = if token_present != 0 {
        SLOTS_WITH_TOKEN
    } else {
        ALL_SLOTS
    };
    unsafe {
        if slot_list.is_null() {
            *count = slots.len() as CK_ULONG;
            return CKR_OK;
        }
        if record().slot_list_races < behaviour().slot_list_races {
            update(|r| r.slot_list_races += 1);
            *count = slots.len() as CK_ULONG + 1;
            return CKR_BUFFER_TOO_SMALL;
        }
        if (*count as usize) < slots.len() {
            *count = slots.len() as CK_ULONG;
            return CKR_BUFFER_TOO_SMALL;
        }
        ptr::copy_nonoverlapping(slots.as_ptr(), slot_list, slots.len());
        *count = slots.len() as CK_ULONG;
    }
    CKR_OK
}

fn pad_into(field: &mut [u8], value: &str) {
    field.fill(b' ');
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}
