//! Output formatting utilities for the CLI
//!
//! Tables describing a session's forwards, durations in human-readable
//! form, and colored status messages.

use std::time::Duration;

use tabled::{settings::Style, Table, Tabled};

use kb_core::config::SessionConfig;

/// Format the forwards of a session as an ASCII table
///
/// Remote services are listed first (cluster to local machine), then local
/// services (local machine into the cluster).
pub fn format_forwards(config: &SessionConfig) -> String {
    if config.remote_services.is_empty() && config.local_services.is_empty() {
        return "No forwards configured".to_string();
    }

    #[derive(Tabled)]
    struct ForwardRow {
        #[tabled(rename = "DIRECTION")]
        direction: &'static str,
        #[tabled(rename = "LOCAL")]
        local: String,
        #[tabled(rename = "CLUSTER")]
        cluster: String,
        #[tabled(rename = "TYPE")]
        kind: String,
    }

    let remote = config.remote_services.iter().map(|r| ForwardRow {
        direction: "cluster -> local",
        local: format!("127.0.0.1:{}", r.port),
        cluster: format!("{}:{}", r.hostname, r.port),
        kind: "-".to_string(),
    });
    let local = config.local_services.iter().map(|l| ForwardRow {
        direction: "local -> cluster",
        local: format!("localhost:{}", l.port),
        cluster: format!("svc/{}:{}", l.service_name, l.port),
        kind: l.routing_type.to_string(),
    });

    Table::new(remote.chain(local).collect::<Vec<_>>())
        .with(Style::rounded())
        .to_string()
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::config::{LocalServiceConfig, RemoteServiceConfig};
    use kb_core::RoutingType;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 0m");
        assert_eq!(format_duration(Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_forwards() {
        let config = SessionConfig {
            remote_services: vec![RemoteServiceConfig::new("postgres", 5432)],
            local_services: vec![LocalServiceConfig::new("web", RoutingType::NodePort, 8080)],
            ..Default::default()
        };

        let table = format_forwards(&config);
        assert!(table.contains("postgres:5432"));
        assert!(table.contains("127.0.0.1:5432"));
        assert!(table.contains("svc/web:8080"));
        assert!(table.contains("NodePort"));
    }

    #[test]
    fn test_format_forwards_empty() {
        assert_eq!(
            format_forwards(&SessionConfig::default()),
            "No forwards configured"
        );
    }
}
