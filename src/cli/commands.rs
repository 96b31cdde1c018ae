//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hubmon")]
#[command(about = "Live monitoring feed for a pub/sub hub", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Monitor host
    #[arg(long, env = "HUBMON_HOST", default_value = "localhost", global = true)]
    pub host: String,

    /// Monitor port
    #[arg(short, long, env = "HUBMON_PORT", default_value_t = 9042, global = true)]
    pub port: u16,

    /// Shared secret for monitor clients
    #[arg(long, env = "HUBMON_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a demo hub with the monitor attached
    ///
    /// Examples:
    ///   hubmon serve
    ///   hubmon serve --password secret --debug
    Serve {
        /// Milliseconds a client has to answer the password request
        #[arg(long, env = "HUBMON_AUTH_TIMEOUT_MS", default_value_t = 1500)]
        auth_timeout_ms: u64,

        /// Log every captured hub event
        #[arg(long)]
        debug: bool,

        /// Milliseconds between generated demo operations (0 disables traffic)
        #[arg(long, default_value_t = 500)]
        demo_interval_ms: u64,
    },

    /// Connect to a monitor and print its feed as JSON lines
    ///
    /// Examples:
    ///   hubmon watch
    ///   hubmon --port 9100 watch --events join,leave
    Watch {
        /// Only print these event kinds (comma separated)
        #[arg(long, value_delimiter = ',', value_parser = parse_event_kind)]
        events: Vec<String>,
    },
}

fn parse_event_kind(s: &str) -> Result<String, String> {
    match hubmon::EventKind::parse(s) {
        Some(kind) => Ok(kind.as_str().to_string()),
        None => Err(format!(
            "Invalid event kind: {}. Use one of: {}",
            s,
            hubmon::EventKind::ALL.map(|k| k.as_str()).join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["hubmon", "serve"]).unwrap();
        assert_eq!(cli.port, 9042);
        assert_eq!(cli.host, "localhost");
        match cli.command {
            Commands::Serve {
                auth_timeout_ms,
                debug,
                demo_interval_ms,
            } => {
                assert_eq!(auth_timeout_ms, 1500);
                assert!(!debug);
                assert_eq!(demo_interval_ms, 500);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_watch_event_filter() {
        let cli = Cli::try_parse_from(["hubmon", "--port", "9100", "watch", "--events", "join,leaveAll"])
            .unwrap();
        assert_eq!(cli.port, 9100);
        match cli.command {
            Commands::Watch { events } => assert_eq!(events, vec!["join", "leaveAll"]),
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_watch_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["hubmon", "watch", "--events", "init"]).is_err());
    }
}
