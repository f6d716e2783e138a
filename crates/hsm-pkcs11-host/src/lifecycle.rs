//! Initialize/finalize state machine for one native module load.
//!
//! ```text
//! Unloaded --load--> Loaded --initialize--> Initialized
//!     \                 \                       |
//!      \-----------------\------dispose---------+--> Finalized
//! ```
//!
//! The loaded module and its function table live inside the `Loaded` and
//! `Initialized` states, so there is no way to reach them from any other
//! state and no separate "disposed" flag to fall out of sync.

use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};

use cryptoki_sys::CK_VOID_PTR;
use tracing::{debug, error, info, warn};

use crate::error::{ModuleError, ModuleResult, check_rv};
use crate::function_table::{DiscoveryStrategy, FunctionTable};
use crate::locking::LockingPolicy;
use crate::module::{ModuleLoader, ModuleSource};

/// Observable lifecycle state of a module load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Unloaded,
    Loaded,
    Initialized,
    Finalized,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Finalized => "finalized",
        })
    }
}

struct LoadedModule {
    source: Box<dyn ModuleSource>,
    table: FunctionTable,
}

enum State {
    Unloaded,
    Loaded(LoadedModule),
    Initialized(LoadedModule),
    Finalized,
}

impl State {
    fn kind(&self) -> ModuleState {
        match self {
            Self::Unloaded => ModuleState::Unloaded,
            Self::Loaded(_) => ModuleState::Loaded,
            Self::Initialized(_) => ModuleState::Initialized,
            Self::Finalized => ModuleState::Finalized,
        }
    }
}

/// Owns one native module load and drives it through its states.
///
/// Transitions take `&mut self`; callers sharing a lifecycle between threads
/// must serialise them. Dropping the lifecycle disposes it.
pub struct ModuleLifecycle {
    path: PathBuf,
    strategy: DiscoveryStrategy,
    locking: LockingPolicy,
    state: State,
}

impl ModuleLifecycle {
    pub fn new(path: impl Into<PathBuf>, strategy: DiscoveryStrategy, locking: LockingPolicy) -> Self {
        Self {
            path: path.into(),
            strategy,
            locking,
            state: State::Unloaded,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strategy(&self) -> DiscoveryStrategy {
        self.strategy
    }

    pub fn locking(&self) -> LockingPolicy {
        self.locking
    }

    pub fn state(&self) -> ModuleState {
        self.state.kind()
    }

    /// Unloaded -> Loaded: loads the module and resolves its function table.
    ///
    /// If resolution fails the module is unloaded again before the error is
    /// returned and the lifecycle stays `Unloaded`.
    pub fn load(&mut self, loader: &dyn ModuleLoader) -> ModuleResult<()> {
        self.require(ModuleState::Unloaded)?;

        let source = loader.load(&self.path)?;
        let table = match self.strategy.resolve(source.as_ref()) {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "function table resolution failed");
                if let Err(unload_err) = source.unload() {
                    error!(
                        path = %self.path.display(),
                        error = %unload_err,
                        "failed to unload module after resolution failure"
                    );
                }
                return Err(err);
            }
        };

        self.state = State::Loaded(LoadedModule { source, table });
        Ok(())
    }

    /// Loaded -> Initialized: calls `C_Initialize` with the locking policy.
    ///
    /// A non-OK return code leaves the lifecycle `Loaded`.
    pub fn initialize(&mut self) -> ModuleResult<()> {
        let module = match mem::replace(&mut self.state, State::Finalized) {
            State::Loaded(module) => module,
            other => {
                self.state = other;
                return Err(self.invalid(ModuleState::Loaded));
            }
        };

        if let Err(err) = initialize(&module.table, self.locking) {
            self.state = State::Loaded(module);
            return Err(err);
        }

        self.state = State::Initialized(module);
        info!(
            path = %self.path.display(),
            os_locking = self.locking.uses_os_locking(),
            "PKCS#11 module initialized"
        );
        Ok(())
    }

    /// Moves to `Finalized`, releasing whatever is held.
    ///
    /// From `Initialized` this calls `C_Finalize` and then unloads even if
    /// finalization failed; the finalize error takes precedence over an
    /// unload error. From `Loaded` the module is unloaded without a native
    /// call. From `Unloaded` or `Finalized` nothing happens besides the state
    /// change, so repeated calls are no-ops.
    pub fn dispose(&mut self) -> ModuleResult<()> {
        match mem::replace(&mut self.state, State::Finalized) {
            State::Unloaded => Ok(()),
            State::Finalized => {
                debug!(path = %self.path.display(), "dispose on finalized module ignored");
                Ok(())
            }
            State::Loaded(module) => module.source.unload(),
            State::Initialized(module) => {
                let finalized = finalize(&module.table);
                if let Err(err) = &finalized {
                    warn!(path = %self.path.display(), error = %err, "C_Finalize reported an error");
                } else {
                    info!(path = %self.path.display(), "PKCS#11 module finalized");
                }
                let unloaded = module.source.unload();
                finalized.and(unloaded)
            }
        }
    }

    /// The function table, available only while initialized.
    pub fn function_table(&self) -> ModuleResult<&FunctionTable> {
        match &self.state {
            State::Initialized(module) => Ok(&module.table),
            _ => Err(self.invalid(ModuleState::Initialized)),
        }
    }

    fn require(&self, required: ModuleState) -> ModuleResult<()> {
        if self.state() == required {
            Ok(())
        } else {
            Err(self.invalid(required))
        }
    }

    fn invalid(&self, required: ModuleState) -> ModuleError {
        ModuleError::InvalidState {
            current: self.state(),
            required,
        }
    }
}

fn initialize(table: &FunctionTable, locking: LockingPolicy) -> ModuleResult<()> {
    let initialize = table.as_raw().C_Initialize.ok_or(ModuleError::MissingSymbol {
        symbol: "C_Initialize",
    })?;
    let mut args = locking.initialize_args();
    // SAFETY: resolved from the loaded module; `args` outlives the call.
    let rv = unsafe { initialize(&mut args as *mut _ as CK_VOID_PTR) };
    check_rv("C_Initialize", rv)
}

fn finalize(table: &FunctionTable) -> ModuleResult<()> {
    let finalize = table.as_raw().C_Finalize.ok_or(ModuleError::MissingSymbol {
        symbol: "C_Finalize",
    })?;
    // SAFETY: resolved from the still-loaded module; pReserved must be NULL.
    let rv = unsafe { finalize(std::ptr::null_mut()) };
    check_rv("C_Finalize", rv)
}

impl Drop for ModuleLifecycle {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            error!(path = %self.path.display(), error = %err, "failed to dispose PKCS#11 module");
        }
    }
}

impl fmt::Debug for ModuleLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLifecycle")
            .field("path", &self.path)
            .field("strategy", &self.strategy)
            .field("locking", &self.locking)
            .field("state", &self.state())
            .finish()
    }
}
