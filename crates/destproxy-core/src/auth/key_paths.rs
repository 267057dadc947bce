//! Service-key locations and the proxy-facing wording of lookup failures.

use super::broker::BrokerError;
use std::path::PathBuf;

/// Sub-path of the service-key directory below the user's home on POSIX systems.
const POSIX_KEY_DIR: &str = ".config/mcp-auth/service-keys";
/// Sub-path of the service-key directory below the user's profile on Windows.
const WINDOWS_KEY_DIR: &str = r"Documents\mcp-auth\service-keys";

/// Expected credential file name for a destination.
pub fn service_key_file_name(destination: &str) -> String {
    format!("{destination}.json")
}

/// Default directories searched for service keys on this platform.
pub fn default_service_key_dirs() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        if cfg!(windows) {
            paths.push(home.join(WINDOWS_KEY_DIR));
        } else {
            paths.push(home.join(POSIX_KEY_DIR));
        }
    }
    paths.push(PathBuf::from("service-keys"));
    paths
}

/// Human-readable search locations, independent of the broker's actual lookup order.
fn documented_locations(windows: bool) -> Vec<&'static str> {
    if windows {
        vec![
            r"%USERPROFILE%\Documents\mcp-auth\service-keys",
            r".\service-keys",
        ]
    } else {
        vec!["~/.config/mcp-auth/service-keys", "./service-keys"]
    }
}

fn not_found_message(destination: &str, windows: bool) -> String {
    let file_name = service_key_file_name(destination);
    let locations = documented_locations(windows)
        .iter()
        .map(|dir| format!("  - {dir}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Service key for destination '{destination}' not found. Place '{file_name}' in one of:\n{locations}"
    )
}

/// Whether a broker message exposes the broker's own key search paths.
fn mentions_search_paths(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("searched") || lower.contains("search path") || lower.contains("service key file")
}

/// Message to surface for a broker failure after retries are exhausted.
///
/// Lookup failures are reworded to name the destination and the expected
/// file without leaking the broker's resolution details.
pub fn describe_broker_failure(destination: &str, err: &BrokerError) -> String {
    let windows = cfg!(windows);
    match err {
        BrokerError::CredentialFileNotFound { .. } => not_found_message(destination, windows),
        other => {
            let message = other.to_string();
            if mentions_search_paths(&message) {
                not_found_message(destination, windows)
            } else {
                message
            }
        }
    }
}
