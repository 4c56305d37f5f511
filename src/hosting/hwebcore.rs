use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use tracing::{debug, info};
use windows_sys::Win32::Foundation::{E_ACCESSDENIED, FreeLibrary, HMODULE};
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows_sys::core::{HRESULT, PCWSTR};

use crate::core::error::{BootstrapError, Result};
use crate::environment::{self, ProcessEnv};

const LIBRARY_PATH: &str = "%windir%\\System32\\inetsrv\\hwebcore.dll";

type ActivateFn = unsafe extern "system" fn(PCWSTR, PCWSTR, PCWSTR) -> HRESULT;
type ShutdownFn = unsafe extern "system" fn(u32) -> HRESULT;

fn wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(Some(0)).collect()
}

/// `hwebcore.dll` loaded into the process
pub(super) struct Library {
    module: HMODULE,
    activate: ActivateFn,
    shutdown: ShutdownFn,
}

// SAFETY: the module handle and exports are process-wide and thread agnostic
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    pub(super) fn load() -> Result<Self> {
        let path = environment::expand_vars(LIBRARY_PATH, &ProcessEnv);
        let wide_path = wide(OsStr::new(&path));

        // SAFETY: NUL terminated path
        let module = unsafe { LoadLibraryW(wide_path.as_ptr()) };
        if module.is_null() {
            return Err(BootstrapError::Activation(format!(
                "unable to load {path}: {}",
                io::Error::last_os_error()
            )));
        }

        // SAFETY: export names are NUL terminated and the signatures match hwebcore.h
        let (activate, shutdown) = unsafe {
            let activate = GetProcAddress(module, b"WebCoreActivate\0".as_ptr());
            let shutdown = GetProcAddress(module, b"WebCoreShutdown\0".as_ptr());
            match (activate, shutdown) {
                (Some(activate), Some(shutdown)) => (
                    std::mem::transmute::<_, ActivateFn>(activate),
                    std::mem::transmute::<_, ShutdownFn>(shutdown),
                ),
                _ => {
                    FreeLibrary(module);
                    return Err(BootstrapError::Activation(format!(
                        "{path} does not export WebCoreActivate/WebCoreShutdown"
                    )));
                }
            }
        };

        debug!(%path, "hostable web core loaded");
        Ok(Self {
            module,
            activate,
            shutdown,
        })
    }

    pub(super) fn activate(
        &self,
        app_host_config: &Path,
        web_config: &Path,
        instance_id: &str,
    ) -> Result<()> {
        let app_host = wide(app_host_config.as_os_str());
        let web = wide(web_config.as_os_str());
        let instance = wide(OsStr::new(instance_id));

        // SAFETY: all arguments are NUL terminated wide strings alive for the call
        let hr = unsafe { (self.activate)(app_host.as_ptr(), web.as_ptr(), instance.as_ptr()) };
        match hr {
            0.. => {
                info!(instance_id, "hostable web core activated");
                Ok(())
            }
            E_ACCESSDENIED => Err(BootstrapError::Authorization(format!("HRESULT {hr:#010x}"))),
            _ => Err(BootstrapError::Activation(format!("HRESULT {hr:#010x}"))),
        }
    }

    pub(super) fn shutdown(&self, immediate: bool) -> Result<()> {
        // SAFETY: plain DWORD argument
        let hr = unsafe { (self.shutdown)(u32::from(immediate)) };
        if hr < 0 {
            return Err(BootstrapError::Activation(format!(
                "shutdown returned HRESULT {hr:#010x}"
            )));
        }
        Ok(())
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: module was loaded by this value
        unsafe { FreeLibrary(self.module) };
    }
}
