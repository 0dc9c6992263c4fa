//! Reading the config file and layering `IFACE_ROUTER_*` overrides on top.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Prefix shared by all environment overrides
pub const ENV_PREFIX: &str = "IFACE_ROUTER_";

type Apply = fn(&mut Config, &str) -> Result<(), String>;

/// Variable suffix and how its value lands in the config
const OVERRIDES: &[(&str, Apply)] = &[
    ("LISTEN_ADDR", set_listen_addr),
    ("LOG_LEVEL", set_log_level),
    ("MAX_FLOWS", set_max_flows),
    ("IPC_SOCKET", set_ipc_socket),
    ("RULES_PATH", set_rules_path),
];

fn set_listen_addr(config: &mut Config, value: &str) -> Result<(), String> {
    config.listen.address = value
        .parse()
        .map_err(|_| format!("{value:?} is not ip:port"))?;
    Ok(())
}

fn set_log_level(config: &mut Config, value: &str) -> Result<(), String> {
    config.log.level = value.to_string();
    Ok(())
}

fn set_max_flows(config: &mut Config, value: &str) -> Result<(), String> {
    config.flow.max_flows = value
        .parse()
        .map_err(|_| format!("{value:?} is not a count"))?;
    Ok(())
}

fn set_ipc_socket(config: &mut Config, value: &str) -> Result<(), String> {
    config.ipc.socket_path = value.into();
    Ok(())
}

fn set_rules_path(config: &mut Config, value: &str) -> Result<(), String> {
    config.rules.store_path = Some(value.into());
    Ok(())
}

/// Reads and validates a JSON config file.
///
/// # Errors
///
/// `FileNotFound` for a missing path, `ParseError` for bad JSON and
/// `ValidationError` for values that parse but make no sense.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let text = std::fs::read_to_string(path)?;
    let config = load_config_str(&text).map_err(|e| match e {
        ConfigError::ParseError(msg) => {
            ConfigError::ParseError(format!("{}: {msg}", path.display()))
        }
        other => other,
    })?;

    let rules = match &config.rules.store_path {
        Some(p) => p.display().to_string(),
        None => format!("{} inline", config.rules.inline.len()),
    };
    info!(
        path = %path.display(),
        listen = %config.listen.address,
        max_flows = config.flow.max_flows,
        rules,
        "configuration loaded"
    );
    Ok(config)
}

/// # Errors
///
/// `ParseError` or `ValidationError`.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// [`load_config`] followed by overrides from the process environment.
///
/// # Errors
///
/// Anything [`load_config`] or [`apply_env_overrides`] returns.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Applies every `IFACE_ROUTER_*` variable that `lookup` knows, then
/// validates the result.
///
/// Recognised suffixes: `LISTEN_ADDR`, `LOG_LEVEL`, `MAX_FLOWS`,
/// `IPC_SOCKET`, `RULES_PATH`. `lookup` is called with the full name.
///
/// # Errors
///
/// `EnvError` naming the first unparsable variable, or `ValidationError`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (suffix, apply) in OVERRIDES {
        let name = format!("{ENV_PREFIX}{suffix}");
        let Some(value) = lookup(&name) else {
            continue;
        };
        apply(config, &value).map_err(|reason| ConfigError::EnvError {
            name: name.clone(),
            reason,
        })?;
        debug!(%name, %value, "environment override applied");
    }
    config.validate()
}

/// Writes [`Config::default_config`] as pretty JSON.
///
/// # Errors
///
/// I/O failures writing `path`.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::default_config())
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    std::fs::write(path, json + "\n")?;
    Ok(())
}
