//! Function table resolution.
//!
//! A PKCS#11 module publishes its entry points either through
//! `C_GetFunctionList`, which hands back a populated `CK_FUNCTION_LIST`, or as
//! flat exported symbols. Both discovery paths end in the same
//! [`FunctionTable`]; resolution is all or nothing.

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use cryptoki_sys::{CK_FUNCTION_LIST, CK_RV, CK_VERSION};
use tracing::{debug, warn};

use crate::error::{ModuleError, ModuleResult, check_rv};
use crate::module::ModuleSource;

/// Name of the function-list getter every PKCS#11 module is expected to export.
pub const GET_FUNCTION_LIST: &str = "C_GetFunctionList";

/// Major interface version accepted from `C_GetFunctionList`.
pub const SUPPORTED_MAJOR_VERSION: u8 = 2;

/// Interface version recorded for tables assembled by symbol lookup.
pub const SYMBOL_LOOKUP_VERSION: CK_VERSION = CK_VERSION {
    major: 2,
    minor: 40,
};

type GetFunctionListFn = unsafe extern "C" fn(*mut *mut CK_FUNCTION_LIST) -> CK_RV;

/// How the entry points of a module are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryStrategy {
    /// Call `C_GetFunctionList` and copy the list it returns.
    #[default]
    FunctionListQuery,
    /// Look every entry point up by name.
    SymbolLookup,
}

impl DiscoveryStrategy {
    pub fn from_get_function_list(use_get_function_list: bool) -> Self {
        if use_get_function_list {
            Self::FunctionListQuery
        } else {
            Self::SymbolLookup
        }
    }

    /// Builds the function table for `source`.
    pub fn resolve(self, source: &dyn ModuleSource) -> ModuleResult<FunctionTable> {
        let table = match self {
            Self::FunctionListQuery => resolve_via_function_list(source)?,
            Self::SymbolLookup => resolve_via_symbols(source)?,
        };
        debug!(
            path = %source.path().display(),
            strategy = ?self,
            version = %format_args!("{}.{}", table.version.major, table.version.minor),
            "function table resolved"
        );
        Ok(table)
    }
}

macro_rules! function_table {
    ($($name:ident),+ $(,)?) => {
        /// Entry points a resolved table always carries, in `CK_FUNCTION_LIST`
        /// order. `C_GetFunctionList` is excluded: modules resolved by symbol
        /// lookup are not required to export it.
        pub const ENTRY_POINTS: &[&str] = &[$(stringify!($name)),+];

        fn first_null_entry(list: &CK_FUNCTION_LIST) -> Option<&'static str> {
            $(
                if list.$name.is_none() {
                    return Some(stringify!($name));
                }
            )+
            None
        }

        fn assemble_from_symbols(source: &dyn ModuleSource) -> ModuleResult<CK_FUNCTION_LIST> {
            Ok(CK_FUNCTION_LIST {
                version: SYMBOL_LOOKUP_VERSION,
                C_GetFunctionList: None,
                $(
                    $name: {
                        let address = source
                            .symbol(stringify!($name))
                            .ok_or(ModuleError::MissingSymbol { symbol: stringify!($name) })?;
                        // SAFETY: the exported symbol carries the PKCS#11 prototype
                        // of the same name; fn pointers and data pointers share a
                        // size on every platform PKCS#11 modules exist for.
                        Some(unsafe { std::mem::transmute::<*mut c_void, _>(address) })
                    },
                )+
            })
        }

        fn entry_address(list: &CK_FUNCTION_LIST, name: &str) -> Option<*const c_void> {
            match name {
                $(stringify!($name) => list.$name.map(|f| f as *const c_void),)+
                _ => None,
            }
        }
    };
}

function_table! {
    C_Initialize,
    C_Finalize,
    C_GetInfo,
    C_GetSlotList,
    C_GetSlotInfo,
    C_GetTokenInfo,
    C_GetMechanismList,
    C_GetMechanismInfo,
    C_InitToken,
    C_InitPIN,
    C_SetPIN,
    C_OpenSession,
    C_CloseSession,
    C_CloseAllSessions,
    C_GetSessionInfo,
    C_GetOperationState,
    C_SetOperationState,
    C_Login,
    C_Logout,
    C_CreateObject,
    C_CopyObject,
    C_DestroyObject,
    C_GetObjectSize,
    C_GetAttributeValue,
    C_SetAttributeValue,
    C_FindObjectsInit,
    C_FindObjects,
    C_FindObjectsFinal,
    C_EncryptInit,
    C_Encrypt,
    C_EncryptUpdate,
    C_EncryptFinal,
    C_DecryptInit,
    C_Decrypt,
    C_DecryptUpdate,
    C_DecryptFinal,
    C_DigestInit,
    C_Digest,
    C_DigestUpdate,
    C_DigestKey,
    C_DigestFinal,
    C_SignInit,
    C_Sign,
    C_SignUpdate,
    C_SignFinal,
    C_SignRecoverInit,
    C_SignRecover,
    C_VerifyInit,
    C_Verify,
    C_VerifyUpdate,
    C_VerifyFinal,
    C_VerifyRecoverInit,
    C_VerifyRecover,
    C_DigestEncryptUpdate,
    C_DecryptDigestUpdate,
    C_SignEncryptUpdate,
    C_DecryptVerifyUpdate,
    C_GenerateKey,
    C_GenerateKeyPair,
    C_WrapKey,
    C_UnwrapKey,
    C_DeriveKey,
    C_SeedRandom,
    C_GenerateRandom,
    C_GetFunctionStatus,
    C_CancelFunction,
    C_WaitForSlotEvent,
}

/// Fully resolved entry points of one loaded module.
///
/// Every name in [`ENTRY_POINTS`] is present. The table holds function
/// pointers into the module, so it is only ever lent out by reference while
/// the module is initialized and cannot be copied out of that borrow:
///
/// ```compile_fail
/// # fn escape(mut pkcs11: hsm_pkcs11_host::Pkcs11) -> hsm_pkcs11_host::ModuleResult<()> {
/// let table = *pkcs11.function_table()?;
/// pkcs11.dispose()?;
/// # let _ = table;
/// # Ok(())
/// # }
/// ```
///
/// Disposing ends the borrow, so a table reference cannot be used afterwards:
///
/// ```compile_fail
/// # fn stale(mut pkcs11: hsm_pkcs11_host::Pkcs11) -> hsm_pkcs11_host::ModuleResult<()> {
/// let table = pkcs11.function_table()?;
/// pkcs11.dispose()?;
/// let _ = table.entry("C_GetInfo");
/// # Ok(())
/// # }
/// ```
pub struct FunctionTable {
    list: CK_FUNCTION_LIST,
    version: CK_VERSION,
    strategy: DiscoveryStrategy,
}

impl FunctionTable {
    pub fn version(&self) -> (u8, u8) {
        (self.version.major, self.version.minor)
    }

    pub fn strategy(&self) -> DiscoveryStrategy {
        self.strategy
    }

    /// Address of a resolved entry point.
    pub fn entry(&self, name: &str) -> Option<*const c_void> {
        entry_address(&self.list, name)
    }

    /// Names of every callable entry point, in `CK_FUNCTION_LIST` order.
    pub fn entry_points(&self) -> impl Iterator<Item = &'static str> + '_ {
        ENTRY_POINTS
            .iter()
            .copied()
            .filter(|name| self.entry(name).is_some())
    }

    /// The underlying list for typed calls. `C_GetFunctionList` is always
    /// `None`; every other member is `Some`.
    ///
    /// `CK_FUNCTION_LIST` is `Copy`. A copy taken through this reference is
    /// not tied to the module's lifetime, and calling through it after
    /// [`Pkcs11::dispose`](crate::Pkcs11::dispose) is undefined behaviour that
    /// the caller's `unsafe` block must rule out.
    pub fn as_raw(&self) -> &CK_FUNCTION_LIST {
        &self.list
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("version", &self.version())
            .field("strategy", &self.strategy)
            .field("entry_points", &ENTRY_POINTS.len())
            .finish()
    }
}

fn resolve_via_function_list(source: &dyn ModuleSource) -> ModuleResult<FunctionTable> {
    let address = source.symbol(GET_FUNCTION_LIST).ok_or(ModuleError::MissingSymbol {
        symbol: GET_FUNCTION_LIST,
    })?;
    // SAFETY: C_GetFunctionList has this prototype in every PKCS#11 version.
    let get_function_list =
        unsafe { std::mem::transmute::<*mut c_void, GetFunctionListFn>(address) };

    let mut list_ptr: *mut CK_FUNCTION_LIST = ptr::null_mut();
    // SAFETY: the getter writes one pointer into `list_ptr`.
    let rv = unsafe { get_function_list(&mut list_ptr) };
    check_rv(GET_FUNCTION_LIST, rv)?;
    if list_ptr.is_null() {
        return Err(ModuleError::NullFunctionList {
            path: source.path().to_path_buf(),
        });
    }

    // SAFETY: non-null and owned by the module, which outlives this copy.
    let mut list = unsafe { *list_ptr };
    let version = list.version;
    if version.major != SUPPORTED_MAJOR_VERSION {
        warn!(
            path = %source.path().display(),
            major = version.major,
            minor = version.minor,
            "module reports an unsupported function list version"
        );
        return Err(ModuleError::UnsupportedVersion {
            major: version.major,
            minor: version.minor,
        });
    }
    if let Some(symbol) = first_null_entry(&list) {
        return Err(ModuleError::MissingSymbol { symbol });
    }
    list.C_GetFunctionList = None;

    Ok(FunctionTable {
        list,
        version,
        strategy: DiscoveryStrategy::FunctionListQuery,
    })
}

fn resolve_via_symbols(source: &dyn ModuleSource) -> ModuleResult<FunctionTable> {
    let list = assemble_from_symbols(source)?;
    Ok(FunctionTable {
        list,
        version: SYMBOL_LOOKUP_VERSION,
        strategy: DiscoveryStrategy::SymbolLookup,
    })
}
