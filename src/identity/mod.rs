//! Optional impersonation around hosting engine activation.
//!
//! An [`IdentityContext`] is entered right before activation and dropped
//! right after it, so alternate credentials are never held while the
//! server runs.
use std::fmt;

use tracing::info;

use crate::core::error::Result;

#[cfg(windows)]
mod windows;

/// Logon credentials for impersonation
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub domain: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Returns `None` when no user is configured.
    ///
    /// `DOMAIN\user` is split when both halves are word characters,
    /// anything else is taken whole as the user name.
    pub fn parse(user: Option<&str>, password: Option<&str>) -> Option<Self> {
        let user = user.filter(|u| !u.is_empty())?;
        let (domain, username) = match user.split_once('\\') {
            Some((domain, name)) if is_word(domain) && is_word(name) => (domain, name),
            _ => ("", user),
        };
        Some(Self {
            domain: domain.to_string(),
            username: username.to_string(),
            password: password.unwrap_or_default().to_string(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Security context the hosting engine is activated under
pub enum IdentityContext {
    Ambient,
    Impersonated(ImpersonationGuard),
}

impl IdentityContext {
    /// Enters the context for `credentials`; ambient when there are none.
    pub fn enter(credentials: Option<&Credentials>) -> Result<Self> {
        match credentials {
            None => Ok(IdentityContext::Ambient),
            Some(credentials) => {
                info!(domain = %credentials.domain, user = %credentials.username, "impersonating");
                ImpersonationGuard::logon(credentials).map(IdentityContext::Impersonated)
            }
        }
    }

    pub fn is_impersonated(&self) -> bool {
        matches!(self, IdentityContext::Impersonated(_))
    }
}

/// Reverts impersonation when dropped
pub struct ImpersonationGuard {
    #[cfg(windows)]
    inner: windows::LogonSession,
}

impl ImpersonationGuard {
    #[cfg(windows)]
    fn logon(credentials: &Credentials) -> Result<Self> {
        windows::LogonSession::impersonate(credentials).map(|inner| Self { inner })
    }

    #[cfg(not(windows))]
    fn logon(_credentials: &Credentials) -> Result<Self> {
        Err(crate::core::error::BootstrapError::Unsupported("Impersonation"))
    }
}

impl Drop for ImpersonationGuard {
    fn drop(&mut self) {
        #[cfg(windows)]
        self.inner.revert();
        info!("impersonation released");
    }
}
