//! Resource lookup hooks used by calculators that load model files.

use std::ffi::{CString, c_char};

use parking_lot::{RwLock, const_rwlock};
use tracing::{debug, warn};

use super::deref_mut;

/// Growable byte string owned by native; callbacks fill it with
/// [`mp_native_string_assign`].
#[derive(Debug, Default)]
pub struct NativeString(Vec<u8>);

/// Maps a resource name to a local path. Returns false if the name is unknown.
pub type PathResolver = unsafe extern "C" fn(path: *const c_char, output: *mut NativeString) -> bool;

/// Reads the bytes of a resolved path. Returns false if it cannot be read.
pub type ResourceProvider = unsafe extern "C" fn(path: *const c_char, output: *mut NativeString) -> bool;

#[derive(Clone, Copy)]
struct Hooks {
    resolver: Option<PathResolver>,
    provider: Option<ResourceProvider>,
}

static HOOKS: RwLock<Hooks> = const_rwlock(Hooks { resolver: None, provider: None });

/// Installs or clears the path resolver.
pub extern "C" fn mp_resource_set_path_resolver(resolver: Option<PathResolver>) {
    HOOKS.write().resolver = resolver;
}

/// Installs or clears the resource provider.
pub extern "C" fn mp_resource_set_provider(provider: Option<ResourceProvider>) {
    HOOKS.write().provider = provider;
}

/// Replaces the contents of `output` with `len` bytes from `data`.
///
/// # Safety
/// `output` must be the pointer passed to the running callback; `data` must be
/// valid for `len` reads.
pub unsafe extern "C" fn mp_native_string_assign(output: *mut NativeString, data: *const u8, len: i32) -> bool {
    let Ok(output) = (unsafe { deref_mut(output, "native string") }) else {
        return false;
    };
    output.0.clear();
    if len > 0 && !data.is_null() {
        // SAFETY: caller guarantees `len` readable bytes.
        output.0.extend_from_slice(unsafe { std::slice::from_raw_parts(data, len as usize) });
    }
    true
}

fn call(hook: unsafe extern "C" fn(*const c_char, *mut NativeString) -> bool, arg: &str) -> Option<Vec<u8>> {
    let arg = CString::new(arg).ok()?;
    let mut output = NativeString::default();
    // SAFETY: both pointers outlive the call.
    let found = unsafe { hook(arg.as_ptr(), &mut output) };
    found.then_some(output.0)
}

/// Resolves a resource name to a path, falling back to the name itself.
pub(crate) fn resolve(name: &str) -> Result<String, String> {
    let hooks = *HOOKS.read();
    match hooks.resolver {
        Some(resolver) => {
            let path = call(resolver, name).ok_or_else(|| format!("unable to resolve '{name}'"))?;
            String::from_utf8(path).map_err(|e| format!("resolved path is not UTF-8: {e}"))
        }
        None => Ok(name.to_string()),
    }
}

/// Loads the bytes of a resource through the installed hooks or the file system.
pub(crate) fn load(name: &str) -> Result<Vec<u8>, String> {
    let path = resolve(name)?;
    let provider = HOOKS.read().provider;
    match provider {
        Some(provider) => {
            let bytes = call(provider, &path).ok_or_else(|| {
                warn!(resource = name, %path, "resource provider failed");
                format!("failed to read '{path}'")
            })?;
            debug!(resource = name, %path, len = bytes.len(), "loaded resource");
            Ok(bytes)
        }
        None => std::fs::read(&path).map_err(|e| format!("failed to read '{path}': {e}")),
    }
}
