//! Host-side PKCS#11 module management for FerroHSM.
//!
//! This crate loads a native PKCS#11 module (smart card middleware, network
//! HSM client, SoftHSM), resolves its entry points and keeps the module inside
//! the call-ordering contract of the standard: `C_Initialize` before any use,
//! `C_Finalize` exactly once, nothing afterwards. Violations that would be
//! undefined behaviour in the native library surface as [`ModuleError`]s.
//!
//! [`Pkcs11`] is the entry point; session and object layers consume the
//! [`FunctionTable`] it lends out while the module is initialized.

pub mod config;
pub mod error;
pub mod function_table;
pub mod lifecycle;
pub mod locking;
pub mod module;
pub mod pkcs11;
pub mod rv;

pub use cryptoki_sys;

pub use config::ModuleConfig;
pub use error::{ModuleError, ModuleResult};
pub use function_table::{DiscoveryStrategy, ENTRY_POINTS, FunctionTable};
pub use lifecycle::{ModuleLifecycle, ModuleState};
pub use locking::LockingPolicy;
pub use module::{DynamicLibrary, DynamicLoader, ModuleLoader, ModuleSource};
pub use pkcs11::{LibraryInfo, ModuleOptions, Pkcs11};
pub use rv::rv_name;
