use serde::Deserialize;
use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::cli::Cli;
use crate::core::error::{BootstrapError, Result};
use crate::environment::{self, EnvSource};
use clap::Parser;

pub const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIRECTORY: &str = "config";
const APPLICATION_HOST_CONFIG: &str = "ApplicationHost.config";
const WEB_CONFIG: &str = "Web.config";
const ASPNET_CONFIG: &str = "AspNet.config";

/// Defaults read from the optional `--configurationPath` YAML file
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    pub network: Option<NetworkConfiguration>,
    pub application: Option<ApplicationConfiguration>,
    pub identity: Option<IdentityConfiguration>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfiguration {
    pub port: Option<u16>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfiguration {
    #[serde(rename = "rootPath")]
    pub root_path: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfiguration {
    pub user: Option<String>,
    pub password: Option<String>,
}

pub async fn load_configuration(path: &str) -> Result<Configuration> {
    let res = tokio::fs::read_to_string(path).await.map_err(|e| {
        BootstrapError::validation(format!("Failed to read configuration file {path}: {e}"))
    })?;

    serde_yaml::from_str::<Configuration>(&res).map_err(|e| {
        BootstrapError::validation(format!("Invalid configuration file {path}: {e}"))
    })
}

/// Everything one bootstrap run needs, fixed once options are loaded.
///
/// The temp and config locations all derive from `application_instance_id`
/// and are never taken from user input.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub root_path: PathBuf,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub application_instance_id: String,
    pub temp_directory: PathBuf,
    pub config_directory: PathBuf,
    pub application_host_config_path: PathBuf,
    pub web_config_path: PathBuf,
    pub aspnet_config_path: PathBuf,
}

impl BootstrapConfig {
    /// Builds a config with a freshly generated instance id.
    pub fn new(
        root_path: PathBuf,
        port: u16,
        user: Option<String>,
        password: Option<String>,
        profile_root: &Path,
    ) -> Self {
        let application_instance_id = Uuid::new_v4().to_string();
        let temp_directory = profile_root.join(format!("tmp{application_instance_id}"));
        let config_directory = temp_directory.join(CONFIG_DIRECTORY);

        Self {
            root_path,
            port,
            user,
            password,
            application_host_config_path: config_directory.join(APPLICATION_HOST_CONFIG),
            web_config_path: config_directory.join(WEB_CONFIG),
            aspnet_config_path: config_directory.join(ASPNET_CONFIG),
            application_instance_id,
            temp_directory,
            config_directory,
        }
    }
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("root_path", &self.root_path)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .field("application_instance_id", &self.application_instance_id)
            .field("temp_directory", &self.temp_directory)
            .field("config_directory", &self.config_directory)
            .finish()
    }
}

/// Strictly parses command line arguments.
///
/// Returns `None` when clap handled `--help` or `--version` itself.
pub fn parse_args<I, T>(args: I) -> Result<Option<Cli>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) if !err.use_stderr() => {
            err.print()?;
            Ok(None)
        }
        Err(err) => Err(BootstrapError::validation(
            err.render().to_string().trim_end(),
        )),
    }
}

/// Resolves parsed arguments into a [`BootstrapConfig`].
///
/// Precedence from lowest to highest: built-in defaults, the YAML file,
/// the `PORT` environment variable, command line flags.
pub async fn load_options(cli: Cli, env: &impl EnvSource, cwd: &Path) -> Result<BootstrapConfig> {
    let file = match cli.configuration_path.as_deref() {
        Some(path) => load_configuration(path).await?,
        None => Configuration::default(),
    };

    let file_port = file.network.as_ref().and_then(|n| n.port);
    let port = cli
        .port
        .or_else(|| environment::port_from_env(env))
        .or(file_port)
        .unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(BootstrapError::validation("Port must be between 1 and 65535"));
    }

    let root = cli
        .app_root_path
        .or_else(|| file.application.and_then(|a| a.root_path));
    let root_path = resolve_root_path(root.as_deref(), cwd)?;

    let (file_user, file_password) = file
        .identity
        .map(|i| (i.user, i.password))
        .unwrap_or_default();
    let user = cli.user.or(file_user).filter(|u| !u.is_empty());
    let mut password = cli.password.or(file_password);
    if user.is_none() && password.take().is_some() {
        warn!("ignoring password, no user to impersonate");
    }

    let profile_root = environment::user_profile_dir(env).ok_or_else(|| {
        BootstrapError::validation("Unable to locate the user profile directory")
    })?;

    let config = BootstrapConfig::new(root_path, port, user, password, &profile_root);
    debug!(?config, "options loaded");
    Ok(config)
}

fn resolve_root_path(root: Option<&str>, cwd: &Path) -> Result<PathBuf> {
    let candidate = match root {
        Some(root) => cwd.join(root),
        None => cwd.to_path_buf(),
    };
    let absolute = std::path::absolute(&candidate)?;
    if !absolute.is_dir() {
        warn!(path = %absolute.display(), "application root path is not a directory");
    }
    Ok(absolute)
}
