//! Configuration loader

use super::Config;
use crate::error::{ProxyError, Result};
use std::path::Path;

/// Load configuration from a YAML file
///
/// `${VAR}` references are resolved and PGAUDIT_PROXY_* overrides applied
/// before validation.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    resolve_config_env_vars(&mut config);
    apply_env_overrides(&mut config);
    config.validate().map_err(ProxyError::Config)?;
    Ok(config)
}

/// Apply PGAUDIT_PROXY_* environment variable overrides.
///
/// - `PGAUDIT_PROXY_LISTEN_ADDRESS` (comma-separated for several)
/// - `PGAUDIT_PROXY_LISTEN_PORT`
/// - `PGAUDIT_PROXY_LOG_LEVEL`
/// - `PGAUDIT_PROXY_CONNECT_TIMEOUT_SECS`
/// - `PGAUDIT_PROXY_IDLE_TIMEOUT_SECS`
/// - `PGAUDIT_PROXY_MAX_CONNECTIONS`
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("PGAUDIT_PROXY_LISTEN_ADDRESS") {
        debug!("Overriding listen_address from PGAUDIT_PROXY_LISTEN_ADDRESS");
        config.server.listen_address = split_addresses(&val);
    }
    if let Some(port) = env_parse::<u16>("PGAUDIT_PROXY_LISTEN_PORT") {
        config.server.listen_port = port;
    }
    if let Ok(val) = std::env::var("PGAUDIT_PROXY_LOG_LEVEL") {
        debug!("Overriding log level from PGAUDIT_PROXY_LOG_LEVEL");
        config.logging.level = val;
    }
    if let Some(secs) = env_parse::<u64>("PGAUDIT_PROXY_CONNECT_TIMEOUT_SECS") {
        config.server.connect_timeout_secs = secs;
    }
    if let Some(secs) = env_parse::<u64>("PGAUDIT_PROXY_IDLE_TIMEOUT_SECS") {
        config.session.idle_timeout_secs = secs;
    }
    if let Some(max) = env_parse::<usize>("PGAUDIT_PROXY_MAX_CONNECTIONS") {
        config.server.max_connections = max;
    }
}

/// Split a comma-separated address list, dropping empty entries.
pub fn split_addresses(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    match val.parse::<T>() {
        Ok(parsed) => {
            debug!("Overriding config from {}", name);
            Some(parsed)
        }
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, val);
            None
        }
    }
}

/// Resolve `${VAR_NAME}` or `$VAR_NAME` when it makes up the whole value.
///
/// Unset variables keep the literal text.
fn resolve_env_var(value: &str) -> String {
    let var_name = if let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}'))
    {
        inner
    } else if let Some(inner) = value.strip_prefix('$') {
        if inner.is_empty() || inner.contains(' ') {
            return value.to_string();
        }
        inner
    } else {
        return value.to_string();
    };

    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            env_value
        }
        Err(_) => {
            debug!("Env var {} not set, keeping original value", var_name);
            value.to_string()
        }
    }
}

fn resolve_config_env_vars(config: &mut Config) {
    for route in &mut config.routes {
        route.database = resolve_env_var(&route.database);
        route.username = resolve_env_var(&route.username);
        route.password = resolve_env_var(&route.password);
        route.host = resolve_env_var(&route.host);
        if let Some(db) = route.backend_database.as_deref() {
            route.backend_database = Some(resolve_env_var(db));
        }
        if let Some(user) = route.backend_username.as_deref() {
            route.backend_username = Some(resolve_env_var(user));
        }
    }
}
