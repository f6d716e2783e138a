//! Native module handles.
//!
//! A [`ModuleSource`] is one loaded PKCS#11 module: something that can hand out
//! symbol addresses and be unloaded exactly once. [`DynamicLoader`] produces
//! them from shared libraries on disk through `libloading`; other loaders
//! (statically linked tokens, in-process doubles) plug in through the same
//! traits.

use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::{debug, info};

use crate::error::{ModuleError, ModuleResult};

/// A loaded native module.
pub trait ModuleSource: Send + Sync {
    /// Path the module was loaded from.
    fn path(&self) -> &Path;

    /// Address of an exported symbol, or `None` when the module does not
    /// export it.
    fn symbol(&self, name: &str) -> Option<*mut c_void>;

    /// Releases the module. Consuming the box makes a second unload
    /// unrepresentable.
    fn unload(self: Box<Self>) -> ModuleResult<()>;
}

/// Produces [`ModuleSource`]s from paths.
pub trait ModuleLoader {
    fn load(&self, path: &Path) -> ModuleResult<Box<dyn ModuleSource>>;
}

/// Loads modules with the platform dynamic loader (`dlopen`/`LoadLibrary`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl ModuleLoader for DynamicLoader {
    fn load(&self, path: &Path) -> ModuleResult<Box<dyn ModuleSource>> {
        DynamicLibrary::open(path).map(|library| Box::new(library) as Box<dyn ModuleSource>)
    }
}

/// A shared library opened through `libloading`.
pub struct DynamicLibrary {
    path: PathBuf,
    library: Library,
}

impl DynamicLibrary {
    pub fn open(path: &Path) -> ModuleResult<Self> {
        debug!(path = %path.display(), "loading PKCS#11 module");
        // SAFETY: loading runs the module's initialisers. PKCS#11 modules
        // must not do meaningful work before C_Initialize.
        let library = unsafe { Library::new(path) }.map_err(|err| ModuleError::load(path, err))?;
        info!(path = %path.display(), "PKCS#11 module loaded");
        Ok(Self {
            path: path.to_path_buf(),
            library,
        })
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("path", &self.path)
            .field("library", &"<native>")
            .finish()
    }
}

impl ModuleSource for DynamicLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        // SAFETY: the symbol is read as an untyped address; callers cast it
        // to the PKCS#11 prototype for that name before calling it.
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        let address = *symbol;
        (!address.is_null()).then_some(address)
    }

    fn unload(self: Box<Self>) -> ModuleResult<()> {
        let DynamicLibrary { path, library } = *self;
        library
            .close()
            .map_err(|err| ModuleError::unload(&path, err))?;
        info!(path = %path.display(), "PKCS#11 module unloaded");
        Ok(())
    }
}
