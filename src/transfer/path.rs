//! Remote path variables.
//!
//! Remote paths of a transfer may contain `${username}` and `${home}`. They
//! are substituted once per task, after the host has been resolved.

use crate::connection::OsType;

/// Home directory of `username` on a host of the given OS family
pub fn home_path(os_type: OsType, username: &str) -> String {
    match os_type {
        OsType::Windows => format!("C:/Users/{}", username),
        OsType::Linux if username == "root" => "/root".to_string(),
        OsType::Linux => format!("/home/{}", username),
    }
}

/// Substitute `${username}` and `${home}` and normalize the result
pub fn replace_path_variables(path: &str, username: &str, home: &str) -> String {
    let replaced = path
        .replace("${username}", username)
        .replace("${home}", home);
    normalize_remote_path(&replaced)
}

/// Use `/` separators and collapse repeated separators
pub fn normalize_remote_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut normalized = String::with_capacity(unified.len());
    let mut previous_slash = false;
    for c in unified.chars() {
        if c == '/' {
            if !previous_slash {
                normalized.push(c);
            }
            previous_slash = true;
        } else {
            normalized.push(c);
            previous_slash = false;
        }
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}
