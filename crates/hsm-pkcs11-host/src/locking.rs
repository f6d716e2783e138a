use std::ptr;

use cryptoki_sys::{CK_C_INITIALIZE_ARGS, CK_FLAGS, CKF_OS_LOCKING_OK};

/// Threading contract announced to the module in `C_Initialize`.
///
/// With [`LockingPolicy::OsLocking`] the module synchronises internally with
/// OS primitives and the function table may be called from several threads at
/// once. With [`LockingPolicy::SingleThreaded`] the application promises to
/// serialise every call itself. No locking is added on the host side in
/// either mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingPolicy {
    #[default]
    SingleThreaded,
    OsLocking,
}

impl LockingPolicy {
    pub fn from_use_os_locking(use_os_locking: bool) -> Self {
        if use_os_locking {
            Self::OsLocking
        } else {
            Self::SingleThreaded
        }
    }

    pub fn uses_os_locking(self) -> bool {
        matches!(self, Self::OsLocking)
    }

    pub fn flags(self) -> CK_FLAGS {
        match self {
            Self::OsLocking => CKF_OS_LOCKING_OK as CK_FLAGS,
            Self::SingleThreaded => 0,
        }
    }

    /// Argument block for `C_Initialize`. Mutex callbacks are never supplied.
    pub fn initialize_args(self) -> CK_C_INITIALIZE_ARGS {
        CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: self.flags(),
            pReserved: ptr::null_mut(),
        }
    }
}
