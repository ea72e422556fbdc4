//! Command-line interface definition.

use clap::{Parser, Subcommand};

use rock_protocol::Codec;

/// rock - call services behind a rock broker
#[derive(Debug, Parser)]
#[command(name = "rock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Broker endpoint
    #[arg(long, short, env = "ROCK_BROKER", default_value = "tcp://localhost:5555")]
    pub broker: String,

    /// Per-attempt timeout in milliseconds
    #[arg(long, default_value = "2500")]
    pub timeout_ms: u64,

    /// Attempts before giving up
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Payload codec (json or mpack)
    #[arg(long, default_value = "json")]
    pub codec: Codec,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Call a method on a service
    Call {
        /// Service name
        service: String,
        /// Method name
        method: String,
        /// Keyword arguments as a JSON object
        #[arg(long, short, default_value = "{}")]
        args: String,
    },
    /// Show a service's info (version, methods)
    Info {
        /// Service name
        service: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let cli = Cli::parse_from([
            "rock", "--codec", "mpack", "call", "users", "create", "--args", r#"{"name":"ada"}"#,
        ]);
        assert_eq!(cli.codec, Codec::MsgPack);
        assert_eq!(cli.broker, "tcp://localhost:5555");
        let Command::Call { service, method, args } = cli.command else {
            panic!("expected call");
        };
        assert_eq!(service, "users");
        assert_eq!(method, "create");
        assert_eq!(args, r#"{"name":"ada"}"#);
    }

    #[test]
    fn parse_info() {
        let cli = Cli::parse_from(["rock", "-b", "ipc:///tmp/rock.sock", "info", "users"]);
        assert_eq!(cli.broker, "ipc:///tmp/rock.sock");
        assert!(matches!(cli.command, Command::Info { service } if service == "users"));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
