use std::path::PathBuf;

use cryptoki_sys::CK_RV;
use thiserror::Error;

use crate::lifecycle::ModuleState;
use crate::rv::rv_name;

pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors surfaced while loading, initializing, using or releasing a
/// native PKCS#11 module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("failed to load PKCS#11 module {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
    #[error("required PKCS#11 symbol {symbol} is missing")]
    MissingSymbol { symbol: &'static str },
    #[error("unsupported cryptoki interface version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("{operation} failed: {} (0x{code:08X})", rv_name(*code))]
    NativeCall { operation: &'static str, code: CK_RV },
    #[error("module is {current}, operation requires {required}")]
    InvalidState {
        current: ModuleState,
        required: ModuleState,
    },
    #[error("C_GetFunctionList in {} returned a null function list", path.display())]
    NullFunctionList { path: PathBuf },
    #[error("failed to unload PKCS#11 module {}: {reason}", path.display())]
    Unload { path: PathBuf, reason: String },
    #[error("invalid module configuration: {0}")]
    Config(String),
}

impl ModuleError {
    pub fn load<P: Into<PathBuf>, E: std::fmt::Display>(path: P, err: E) -> Self {
        Self::Load {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn unload<P: Into<PathBuf>, E: std::fmt::Display>(path: P, err: E) -> Self {
        Self::Unload {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }

    /// Returns the raw PKCS#11 return code for errors reported by the module.
    pub fn return_code(&self) -> Option<CK_RV> {
        match self {
            Self::NativeCall { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Maps a native return code to `Ok(())` or a `NativeCall` error.
pub(crate) fn check_rv(operation: &'static str, code: CK_RV) -> ModuleResult<()> {
    if code == cryptoki_sys::CKR_OK {
        Ok(())
    } else {
        Err(ModuleError::NativeCall { operation, code })
    }
}
