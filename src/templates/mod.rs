use std::fs;

use tracing::debug;

use crate::core::configuration::BootstrapConfig;
use crate::core::error::Result;

const APPLICATION_HOST_TEMPLATE: &str = include_str!("ApplicationHost.config");
const WEB_TEMPLATE: &str = include_str!("Web.config");
const ASPNET_TEMPLATE: &str = include_str!("AspNet.config");

/// The three documents the hostable web core is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfigSet {
    pub application_host: String,
    pub web: String,
    pub aspnet: String,
}

impl RenderedConfigSet {
    /// Renders all templates for `config`. Pure text substitution.
    pub fn render(config: &BootstrapConfig) -> Self {
        let settings = settings(config);
        Self {
            application_host: render_template(APPLICATION_HOST_TEMPLATE, &settings),
            web: render_template(WEB_TEMPLATE, &settings),
            aspnet: render_template(ASPNET_TEMPLATE, &settings),
        }
    }

    /// Creates the config directory and writes each document to its path.
    pub fn write_to(&self, config: &BootstrapConfig) -> Result<()> {
        fs::create_dir_all(&config.config_directory)?;
        for (path, text) in [
            (&config.application_host_config_path, &self.application_host),
            (&config.web_config_path, &self.web),
            (&config.aspnet_config_path, &self.aspnet),
        ] {
            fs::write(path, text)?;
            debug!(path = %path.display(), "config written");
        }
        Ok(())
    }
}

fn settings(config: &BootstrapConfig) -> [(&'static str, String); 5] {
    [
        ("PORT", config.port.to_string()),
        ("ROOT_PATH", config.root_path.display().to_string()),
        ("INSTANCE_ID", config.application_instance_id.clone()),
        ("TEMP_DIRECTORY", config.temp_directory.display().to_string()),
        ("ASPNET_CONFIG_PATH", config.aspnet_config_path.display().to_string()),
    ]
}

fn render_template(template: &str, settings: &[(&'static str, String)]) -> String {
    settings
        .iter()
        .fold(template.to_string(), |text, (name, value)| {
            text.replace(&format!("{{{{{name}}}}}"), &escape_xml(value))
        })
}

/// Escapes a value for use inside an attribute or text node.
pub fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
