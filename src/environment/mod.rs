use std::{collections::HashMap, env, path::PathBuf};

use tracing::warn;

const DELIMITER: char = '%';
const PORT_VARIABLE: &str = "PORT";
const PROFILE_VARIABLES: [&str; 2] = ["USERPROFILE", "HOME"];

/// Read access to a set of environment variables.
///
/// The bootstrapper reads the process environment, tests feed a plain map.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The environment of the running process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Expands `%NAME%` references the way Windows does.
///
/// Defined variables are substituted, undefined ones and a dangling `%`
/// are kept verbatim.
pub fn expand_vars(input: &str, source: &impl EnvSource) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(DELIMITER) {
        output.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        match tail.find(DELIMITER) {
            Some(end) => {
                let name = &tail[..end];
                match (!name.is_empty()).then(|| source.var(name)).flatten() {
                    Some(value) => {
                        output.push_str(&value);
                        rest = &tail[end + 1..];
                    }
                    None => {
                        // the closing '%' may open the next reference
                        output.push(DELIMITER);
                        output.push_str(name);
                        rest = &tail[end..];
                    }
                }
            }
            None => {
                output.push(DELIMITER);
                rest = tail;
            }
        }
    }

    output.push_str(rest);
    output
}

/// Port taken from the `PORT` variable, if it holds a usable value.
pub fn port_from_env(source: &impl EnvSource) -> Option<u16> {
    let raw = source.var(PORT_VARIABLE)?;
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => {
            warn!(value = %raw, "ignoring {PORT_VARIABLE} environment variable, not a valid port");
            None
        }
    }
}

/// Root of the current user's profile directory.
pub fn user_profile_dir(source: &impl EnvSource) -> Option<PathBuf> {
    PROFILE_VARIABLES
        .iter()
        .filter_map(|key| source.var(key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}
