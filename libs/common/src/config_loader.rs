//! Configuration value helpers with fallback logic

use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, warn};

/// Get configuration value with priority: explicit > ENV > default
///
/// # Arguments
/// * `explicit` - Value given on the command line or in code
/// * `env_var` - Environment variable name to check
/// * `default` - Fallback, typically from the config file
pub fn get_config_value<T>(explicit: Option<T>, env_var: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(val) = explicit {
        debug!("Using explicit {}", env_var);
        return val;
    }

    if let Ok(env_str) = std::env::var(env_var) {
        match env_str.parse::<T>() {
            Ok(val) => {
                debug!("Using {} from environment: {}", env_var, env_str);
                return val;
            },
            Err(e) => {
                warn!("Failed to parse {} from environment: {}", env_var, e);
            },
        }
    }

    default
}

/// String variant of [`get_config_value`]; empty strings count as unset.
pub fn get_string_config(explicit: Option<String>, env_var: &str, default: String) -> String {
    if let Some(val) = explicit.filter(|v| !v.is_empty()) {
        return val;
    }
    match std::env::var(env_var) {
        Ok(env_val) if !env_val.is_empty() => env_val,
        _ => default,
    }
}
