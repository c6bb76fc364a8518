use std::env::var;

/// Get the value of ENV var, if there is one
///
/// Only when:
/// - It is set
/// - It is not empty
pub fn env_var(var_name: &str) -> Option<String> {
    var(var_name).ok().filter(|value| !value.is_empty())
}

/// Get the value of ENV var, or a default
///
/// Same rules as [`env_var`]
pub fn env_var_or(var_name: &str, default: &str) -> String {
    env_var(var_name).unwrap_or_else(|| default.to_string())
}
