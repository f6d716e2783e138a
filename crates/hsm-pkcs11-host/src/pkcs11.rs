//! The application-facing module handle.

use std::path::Path;
use std::ptr;

use cryptoki_sys::{
    CK_BBOOL, CK_FLAGS, CK_FUNCTION_LIST, CK_INFO, CK_RV, CK_SLOT_ID, CK_ULONG,
    CKR_BUFFER_TOO_SMALL, CKR_OK,
};
use tracing::{debug, error};

use crate::config::ModuleConfig;
use crate::error::{ModuleError, ModuleResult, check_rv};
use crate::function_table::{DiscoveryStrategy, FunctionTable};
use crate::lifecycle::{ModuleLifecycle, ModuleState};
use crate::locking::LockingPolicy;
use crate::module::{DynamicLoader, ModuleLoader};

/// Count/fill rounds `get_slot_list` makes before giving up on a slot list
/// that keeps growing.
pub const SLOT_LIST_ATTEMPTS: usize = 4;

/// Construction options for [`Pkcs11`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleOptions {
    pub locking: LockingPolicy,
    pub discovery: DiscoveryStrategy,
}

impl ModuleOptions {
    pub fn new(use_os_locking: bool, use_get_function_list: bool) -> Self {
        Self {
            locking: LockingPolicy::from_use_os_locking(use_os_locking),
            discovery: DiscoveryStrategy::from_get_function_list(use_get_function_list),
        }
    }
}

/// General information reported by `C_GetInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    pub cryptoki_version: (u8, u8),
    pub manufacturer_id: String,
    pub flags: CK_FLAGS,
    pub library_description: String,
    pub library_version: (u8, u8),
}

/// A loaded and initialized PKCS#11 module.
///
/// Construction loads the module, resolves its entry points and calls
/// `C_Initialize`; [`Pkcs11::dispose`] (or dropping the value) calls
/// `C_Finalize` and unloads it. Each value is an independent load.
///
/// ```no_run
/// use hsm_pkcs11_host::Pkcs11;
///
/// let mut pkcs11 = Pkcs11::new("/usr/lib/softhsm/libsofthsm2.so", false)?;
/// let info = pkcs11.get_info()?;
/// println!("{} {}", info.manufacturer_id, info.library_description);
/// pkcs11.dispose()?;
/// # Ok::<(), hsm_pkcs11_host::ModuleError>(())
/// ```
#[derive(Debug)]
pub struct Pkcs11 {
    lifecycle: ModuleLifecycle,
}

impl Pkcs11 {
    /// Loads `path` through `C_GetFunctionList`.
    pub fn new(path: impl AsRef<Path>, use_os_locking: bool) -> ModuleResult<Self> {
        Self::with_discovery(path, use_os_locking, true)
    }

    /// Loads `path`; `use_get_function_list = false` resolves every entry
    /// point by symbol instead, for modules without `C_GetFunctionList`.
    pub fn with_discovery(
        path: impl AsRef<Path>,
        use_os_locking: bool,
        use_get_function_list: bool,
    ) -> ModuleResult<Self> {
        Self::open(
            path,
            ModuleOptions::new(use_os_locking, use_get_function_list),
            &DynamicLoader,
        )
    }

    pub fn from_config(config: &ModuleConfig) -> ModuleResult<Self> {
        Self::open(&config.library_path, config.options(), &DynamicLoader)
    }

    /// Loads and initializes `path` with an explicit loader.
    ///
    /// On error nothing stays loaded.
    pub fn open(
        path: impl AsRef<Path>,
        options: ModuleOptions,
        loader: &dyn ModuleLoader,
    ) -> ModuleResult<Self> {
        let mut lifecycle =
            ModuleLifecycle::new(path.as_ref(), options.discovery, options.locking);
        lifecycle.load(loader)?;
        if let Err(err) = lifecycle.initialize() {
            if let Err(dispose_err) = lifecycle.dispose() {
                error!(
                    path = %lifecycle.path().display(),
                    error = %dispose_err,
                    "failed to release module after initialization failure"
                );
            }
            return Err(err);
        }
        Ok(Self { lifecycle })
    }

    pub fn path(&self) -> &Path {
        self.lifecycle.path()
    }

    pub fn state(&self) -> ModuleState {
        self.lifecycle.state()
    }

    pub fn locking_policy(&self) -> LockingPolicy {
        self.lifecycle.locking()
    }

    pub fn discovery(&self) -> DiscoveryStrategy {
        self.lifecycle.strategy()
    }

    /// Finalizes and unloads the module. Safe to call repeatedly.
    pub fn dispose(&mut self) -> ModuleResult<()> {
        self.lifecycle.dispose()
    }

    /// Resolved entry points for session and object layers; fails unless the
    /// module is initialized.
    pub fn function_table(&self) -> ModuleResult<&FunctionTable> {
        self.lifecycle.function_table()
    }

    /// Forwards one native call through the function table and maps its
    /// return code.
    ///
    /// ```no_run
    /// # use hsm_pkcs11_host::{Pkcs11, cryptoki_sys::CK_ULONG};
    /// # let pkcs11 = Pkcs11::new("/usr/lib/softhsm/libsofthsm2.so", true)?;
    /// let mut count: CK_ULONG = 0;
    /// pkcs11.call("C_GetSlotList", |f| unsafe {
    ///     (f.C_GetSlotList.unwrap())(0, std::ptr::null_mut(), &mut count)
    /// })?;
    /// # Ok::<(), hsm_pkcs11_host::ModuleError>(())
    /// ```
    pub fn call<F>(&self, operation: &'static str, f: F) -> ModuleResult<()>
    where
        F: FnOnce(&CK_FUNCTION_LIST) -> CK_RV,
    {
        let table = self.function_table()?;
        let rv = f(table.as_raw());
        debug!(operation, rv, "forwarded PKCS#11 call");
        check_rv(operation, rv)
    }

    /// General information about the module (`C_GetInfo`).
    pub fn get_info(&self) -> ModuleResult<LibraryInfo> {
        // SAFETY: CK_INFO is plain data; zero is a valid bit pattern.
        let mut info: CK_INFO = unsafe { std::mem::zeroed() };
        self.call("C_GetInfo", |f| match f.C_GetInfo {
            // SAFETY: `info` is a valid, writable CK_INFO.
            Some(get_info) => unsafe { get_info(&mut info) },
            None => cryptoki_sys::CKR_FUNCTION_NOT_SUPPORTED,
        })?;
        Ok(LibraryInfo {
            cryptoki_version: (info.cryptokiVersion.major, info.cryptokiVersion.minor),
            manufacturer_id: blank_padded(&info.manufacturerID),
            flags: info.flags,
            library_description: blank_padded(&info.libraryDescription),
            library_version: (info.libraryVersion.major, info.libraryVersion.minor),
        })
    }

    /// Slot identifiers (`C_GetSlotList`), optionally only those with a token
    /// present.
    ///
    /// A slot list that grows between the count and fill calls is read again,
    /// up to [`SLOT_LIST_ATTEMPTS`] times; after that the
    /// `CKR_BUFFER_TOO_SMALL` from the module is returned.
    pub fn get_slot_list(&self, token_present: bool) -> ModuleResult<Vec<CK_SLOT_ID>> {
        let present = CK_BBOOL::from(token_present);
        let get_slot_list = self
            .function_table()?
            .as_raw()
            .C_GetSlotList
            .ok_or(ModuleError::MissingSymbol {
                symbol: "C_GetSlotList",
            })?;

        for attempt in 1..=SLOT_LIST_ATTEMPTS {
            let mut count: CK_ULONG = 0;
            // SAFETY: a null list pointer asks only for the count.
            let rv = unsafe { get_slot_list(present, ptr::null_mut(), &mut count) };
            check_rv("C_GetSlotList", rv)?;
            if count == 0 {
                return Ok(Vec::new());
            }

            let mut slots: Vec<CK_SLOT_ID> = vec![0; count as usize];
            // SAFETY: `slots` holds `count` writable elements.
            let rv = unsafe { get_slot_list(present, slots.as_mut_ptr(), &mut count) };
            match rv {
                CKR_OK => {
                    slots.truncate(count as usize);
                    return Ok(slots);
                }
                // A slot appeared between the two calls.
                CKR_BUFFER_TOO_SMALL => {
                    debug!(attempt, "slot list grew while being read");
                }
                code => {
                    return Err(ModuleError::NativeCall {
                        operation: "C_GetSlotList",
                        code,
                    });
                }
            }
        }

        Err(ModuleError::NativeCall {
            operation: "C_GetSlotList",
            code: CKR_BUFFER_TOO_SMALL,
        })
    }
}

fn blank_padded(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != 0)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
