use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::core::error::{BootstrapError, Result};
use crate::environment::{self, EnvSource};

const GLOBAL_MODULES_PATH: [&str; 3] = ["configuration", "system.webServer", "globalModules"];

/// A native module declared in the application host document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReference {
    pub name: String,
    pub module_image_path: PathBuf,
}

/// Answers whether a module image is present.
pub trait FileCheck {
    fn exists(&self, path: &Path) -> bool;
}

/// Checks the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCheck;

impl FileCheck for FsCheck {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Extracts every `globalModules/add` entry with its image path expanded.
pub fn global_modules(
    application_host: &str,
    env: &impl EnvSource,
) -> Result<Vec<DependencyReference>> {
    let doc = roxmltree::Document::parse(application_host)?;
    let root = doc.root_element();
    if !root.has_tag_name(GLOBAL_MODULES_PATH[0]) {
        return Ok(Vec::new());
    }

    let sections = root
        .children()
        .filter(|n| n.has_tag_name(GLOBAL_MODULES_PATH[1]))
        .flat_map(|n| n.children())
        .filter(|n| n.has_tag_name(GLOBAL_MODULES_PATH[2]));

    let mut references = Vec::new();
    for entry in sections.flat_map(|n| n.children()).filter(|n| n.has_tag_name("add")) {
        let name = entry.attribute("name").unwrap_or_default().to_string();
        let image = entry.attribute("image").ok_or_else(|| {
            BootstrapError::validation(format!("Global module '{name}' has no image attribute"))
        })?;
        references.push(DependencyReference {
            name,
            module_image_path: PathBuf::from(environment::expand_vars(image, env)),
        });
    }
    Ok(references)
}

/// Fails with every missing module image listed, in document order.
pub fn validate_required_dll_dependencies(
    application_host: &str,
    env: &impl EnvSource,
    files: &dyn FileCheck,
) -> Result<()> {
    let references = global_modules(application_host, env)?;
    let missing: Vec<String> = references
        .iter()
        .filter(|r| !files.exists(&r.module_image_path))
        .map(|r| r.module_image_path.display().to_string())
        .collect();

    if !missing.is_empty() {
        error!(count = missing.len(), "native module images missing");
        return Err(BootstrapError::validation(format!(
            "Missing required dlls:\n{}",
            missing.join("\n")
        )));
    }

    debug!(count = references.len(), "all native module images present");
    Ok(())
}
