use std::path::Path;

use crate::core::error::Result;

#[cfg(windows)]
mod hwebcore;

/// The in-process web server being bootstrapped
pub trait HostingEngine: Send + Sync {
    fn activate(&self, app_host_config: &Path, web_config: &Path, instance_id: &str)
    -> Result<()>;

    fn shutdown(&self, immediate: bool) -> Result<()>;
}

/// IIS Hostable Web Core, `hwebcore.dll`
#[derive(Default)]
pub struct HostableWebCore {
    #[cfg(windows)]
    library: std::sync::OnceLock<hwebcore::Library>,
}

impl HostableWebCore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(windows)]
impl HostingEngine for HostableWebCore {
    fn activate(
        &self,
        app_host_config: &Path,
        web_config: &Path,
        instance_id: &str,
    ) -> Result<()> {
        let library = match self.library.get() {
            Some(library) => library,
            None => {
                let loaded = hwebcore::Library::load()?;
                self.library.get_or_init(|| loaded)
            }
        };
        library.activate(app_host_config, web_config, instance_id)
    }

    fn shutdown(&self, immediate: bool) -> Result<()> {
        match self.library.get() {
            Some(library) => library.shutdown(immediate),
            None => Ok(()),
        }
    }
}

#[cfg(not(windows))]
impl HostingEngine for HostableWebCore {
    fn activate(&self, _: &Path, _: &Path, _: &str) -> Result<()> {
        Err(crate::core::error::BootstrapError::Unsupported("Hostable Web Core"))
    }

    fn shutdown(&self, _immediate: bool) -> Result<()> {
        Err(crate::core::error::BootstrapError::Unsupported("Hostable Web Core"))
    }
}
