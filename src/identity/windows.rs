use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::ptr;

use tracing::warn;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Security::{
    ImpersonateLoggedOnUser, LOGON32_LOGON_NETWORK, LOGON32_PROVIDER_DEFAULT, LogonUserW,
    RevertToSelf,
};

use super::Credentials;
use crate::core::error::{BootstrapError, Result};

pub(super) fn wide(value: &str) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(Some(0)).collect()
}

/// A network logon token the current thread impersonates
pub(super) struct LogonSession {
    token: HANDLE,
    reverted: bool,
}

// SAFETY: the token handle is owned exclusively by this session
unsafe impl Send for LogonSession {}

impl LogonSession {
    pub(super) fn impersonate(credentials: &Credentials) -> Result<Self> {
        let username = wide(&credentials.username);
        let domain = wide(&credentials.domain);
        let password = wide(&credentials.password);
        let mut token: HANDLE = ptr::null_mut();

        // SAFETY: all strings are NUL terminated and outlive the call
        let ok = unsafe {
            LogonUserW(
                username.as_ptr(),
                domain.as_ptr(),
                password.as_ptr(),
                LOGON32_LOGON_NETWORK,
                LOGON32_PROVIDER_DEFAULT,
                &mut token,
            )
        };
        if ok == 0 {
            return Err(BootstrapError::Identity(format!(
                "logon failed for {}: {}",
                credentials.username,
                io::Error::last_os_error()
            )));
        }

        // SAFETY: token is a valid logon handle returned above
        if unsafe { ImpersonateLoggedOnUser(token) } == 0 {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(token) };
            return Err(BootstrapError::Identity(format!(
                "impersonation failed for {}: {err}",
                credentials.username
            )));
        }

        Ok(Self {
            token,
            reverted: false,
        })
    }

    pub(super) fn revert(&mut self) {
        if self.reverted {
            return;
        }
        self.reverted = true;
        // SAFETY: called on the impersonating thread with a handle we own
        unsafe {
            if RevertToSelf() == 0 {
                warn!(error = %io::Error::last_os_error(), "RevertToSelf failed");
            }
            CloseHandle(self.token);
        }
    }
}

impl Drop for LogonSession {
    fn drop(&mut self) {
        self.revert();
    }
}
