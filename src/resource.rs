//! Model and config assets the native graph loads by name.
//!
//! The graph never touches the host's asset store directly. A
//! [`ResourceManager`] prepares assets ahead of time, and [`install`] makes it
//! the process-wide answer to the graph's "where is `name`?" and "give me the
//! bytes at `path`" questions.

use std::collections::HashMap;
use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{RwLock, const_rwlock};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::native::{self, NativeString};

/// Host-side asset store consulted by the native graph.
///
/// `resolve_path` and `read` run on graph worker threads and must not block on
/// the thread that drives the graph.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Whether `name` has been prepared and can be resolved.
    fn is_prepared(&self, name: &str) -> bool;

    /// Makes `name` available locally, stored under `unique_key` if given.
    ///
    /// An asset that is already prepared is kept unless `overwrite` is set.
    async fn prepare_asset(&self, name: &str, unique_key: Option<&str>, overwrite: bool) -> Result<PathBuf>;

    fn resolve_path(&self, name: &str) -> Option<PathBuf>;

    fn read(&self, path: &Path) -> Option<Vec<u8>>;
}

/// Copies assets out of a source directory into a cache directory.
#[derive(Debug)]
pub struct LocalResourceManager {
    source_dir: PathBuf,
    cache_dir: PathBuf,
    prepared: RwLock<HashMap<String, PathBuf>>,
}

impl LocalResourceManager {
    pub fn new(source_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self { source_dir: source_dir.into(), cache_dir: cache_dir.into(), prepared: RwLock::new(HashMap::new()) }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    fn is_prepared(&self, name: &str) -> bool {
        self.prepared.read().contains_key(name)
    }

    async fn prepare_asset(&self, name: &str, unique_key: Option<&str>, overwrite: bool) -> Result<PathBuf> {
        if !overwrite {
            if let Some(path) = self.prepared.read().get(name) {
                return Ok(path.clone());
            }
        }

        let source = self.source_dir.join(name);
        let target = self.cache_dir.join(unique_key.unwrap_or(name));
        let cached = fs::try_exists(&target).await.map_err(|e| BridgeError::file_error(target.clone(), e))?;
        if overwrite || !cached {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(|e| BridgeError::file_error(parent.to_path_buf(), e))?;
            }
            let bytes = fs::copy(&source, &target)
                .await
                .map_err(|e| BridgeError::resource_with_source(name, Box::new(e)))?;
            debug!(resource = name, path = %target.display(), bytes, "asset copied into cache");
        }

        self.prepared.write().insert(name.to_string(), target.clone());
        Ok(target)
    }

    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        self.prepared.read().get(name).cloned()
    }

    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read asset");
                None
            }
        }
    }
}

static MANAGER: RwLock<Option<Arc<dyn ResourceManager>>> = const_rwlock(None);

/// Routes the graph's resource lookups to `manager`, replacing any previous one.
pub fn install(manager: Arc<dyn ResourceManager>) {
    *MANAGER.write() = Some(manager);
    native::mp_resource_set_path_resolver(Some(resolve_path_hook));
    native::mp_resource_set_provider(Some(read_hook));
    info!("resource manager installed");
}

/// Removes the installed manager. The graph falls back to reading names as file paths.
pub fn uninstall() {
    native::mp_resource_set_path_resolver(None);
    native::mp_resource_set_provider(None);
    if MANAGER.write().take().is_some() {
        info!("resource manager uninstalled");
    }
}

pub fn is_installed() -> bool {
    MANAGER.read().is_some()
}

fn assign(output: *mut NativeString, bytes: &[u8]) -> bool {
    let Ok(len) = i32::try_from(bytes.len()) else {
        warn!(len = bytes.len(), "asset is too large to hand to native");
        return false;
    };
    // SAFETY: `output` is the string native passed to the running hook.
    unsafe { native::mp_native_string_assign(output, bytes.as_ptr(), len) }
}

fn with_manager(arg: *const c_char, f: impl FnOnce(&dyn ResourceManager, &str) -> Option<Vec<u8>>) -> Option<Vec<u8>> {
    let manager = MANAGER.read().clone()?;
    if arg.is_null() {
        return None;
    }
    // SAFETY: native passes a NUL-terminated string that outlives the hook.
    let arg = unsafe { CStr::from_ptr(arg) }.to_str().ok()?;
    f(manager.as_ref(), arg)
}

unsafe extern "C" fn resolve_path_hook(name: *const c_char, output: *mut NativeString) -> bool {
    let resolved = catch_unwind(AssertUnwindSafe(|| {
        with_manager(name, |manager, name| {
            let path = manager.resolve_path(name);
            if path.is_none() {
                warn!(resource = name, "asset was never prepared");
            }
            path.map(|path| path.to_string_lossy().into_owned().into_bytes())
        })
    }));
    match resolved {
        Ok(Some(path)) => assign(output, &path),
        Ok(None) => false,
        Err(_) => {
            warn!("resource manager panicked while resolving a path");
            false
        }
    }
}

unsafe extern "C" fn read_hook(path: *const c_char, output: *mut NativeString) -> bool {
    let read = catch_unwind(AssertUnwindSafe(|| with_manager(path, |manager, path| manager.read(Path::new(path)))));
    match read {
        Ok(Some(bytes)) => assign(output, &bytes),
        Ok(None) => false,
        Err(_) => {
            warn!("resource manager panicked while reading an asset");
            false
        }
    }
}
