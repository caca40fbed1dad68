//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use kb_core::config::{self, SessionConfig};

/// Session file to use: the `--config` value or the default location
pub fn resolve_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load and validate a session file
pub fn load_session(path: &Path) -> Result<SessionConfig> {
    let session: SessionConfig = config::load_config(path)
        .with_context(|| format!("Failed to load session file {:?}", path))?;
    session
        .validate()
        .with_context(|| format!("Invalid session file {:?}", path))?;
    Ok(session)
}

/// Show the effective configuration, defaults included
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve_path(config_path);

    if !path.exists() {
        print_warning(&format!("No session file found at {:?}", path));
        print_info("Run 'k-bridge config init' to create one");
        return Ok(());
    }

    let session = load_session(&path)?;
    print_info(&format!("Session file: {:?}", path));
    println!();
    println!("{}", toml::to_string_pretty(&session)?);

    Ok(())
}

/// Write a starter session file
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = resolve_path(config_path);

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
            print_success(&format!("Created config directory: {:?}", dir));
        }
    }

    if path.exists() && !force {
        print_error(&format!("Session file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    std::fs::write(&path, DEFAULT_SESSION)
        .with_context(|| format!("Failed to write session file: {:?}", path))?;
    print_success(&format!("Created session file: {:?}", path));

    Ok(())
}

/// Print where the session file is looked up
pub fn config_path(config_path: Option<&PathBuf>) {
    println!("{}", resolve_path(config_path).display());
}

const DEFAULT_SESSION: &str = r#"# k-Bridge session
#
# remote_services are cluster endpoints forwarded to 127.0.0.1 on this machine.
# local_services are Services in the namespace that are pointed at this
# machine for the duration of the session.

# Namespace to work in (defaults to the current kube context's namespace)
# namespace = "dev"

# completion = "first-settled"    # or "all-settled"

[[remote_services]]
hostname = "postgres"
port = 5432

[[local_services]]
service_name = "web"
routing_type = "ClusterIP"        # ClusterIP, NodePort or LoadBalancer
port = 8080

[bridge]
image = "quay.io/k-bridge/ssh-bridge:latest"
ssh_container_port = 2222

[timing]
# Seconds
pod_ready_timeout = 10
auth_timeout = 10
session_lifetime = 3600
stop_grace = 5
# Milliseconds
user_marker_interval = 500
tunnel_health_interval = 1000
user_marker_attempts = 20

[timing.backoff]
# Seconds between SSH reconnect attempts
initial = 5
max = 5
multiplier = 1.0
jitter = 0.0
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_session_is_valid() {
        let session: SessionConfig = toml::from_str(DEFAULT_SESSION).unwrap();
        session.validate().unwrap();

        assert_eq!(session.remote_services[0].port, 5432);
        assert_eq!(session.local_services[0].service_name, "web");
        assert_eq!(session.timing.user_marker_interval, Duration::from_millis(500));
        assert_eq!(session.timing.backoff.initial, Duration::from_secs(5));
    }

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.toml");

        config_init(Some(&path), false).unwrap();
        let session = load_session(&path).unwrap();
        assert_eq!(session.bridge.ssh_container_port, 2222);
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "namespace = \"mine\"\n").unwrap();

        config_init(Some(&path), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "namespace = \"mine\"\n"
        );

        config_init(Some(&path), true).unwrap();
        assert!(load_session(&path).is_ok());
    }
}
