//! Clap CLI definitions for the `tether` binary.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tether serve                          Serve the builtin toolkit on the configured address
  tether serve --listen 0.0.0.0:4760    Serve on a specific address
  tether probe 127.0.0.1:4760           Create a toolkit root on a node and list it
  tether probe 127.0.0.1:4760 --mimetype app/x --args '{\"n\": 1}'";

/// Tether: live object sharing between two peers.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node that accepts peers over TCP.
    Serve {
        /// Address to listen on (overrides `listen_addr` from config).
        #[arg(long)]
        listen: Option<String>,
        /// Node name used in logs (overrides `node_name` from config).
        #[arg(long)]
        name: Option<String>,
    },
    /// Connect to a node, create a root object and print its properties.
    Probe {
        /// Address of the node.
        addr: SocketAddr,
        /// Object type to create.
        #[arg(long, default_value = "toolkit")]
        mimetype: String,
        /// Creation arguments as JSON.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Keep the spawn alive instead of destroying it afterwards.
        #[arg(long)]
        keep: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["tether", "serve", "--listen", "127.0.0.1:0"]).unwrap();
        match cli.command {
            Commands::Serve { listen, name } => {
                assert_eq!(listen.as_deref(), Some("127.0.0.1:0"));
                assert!(name.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_probe_defaults() {
        let cli = Cli::try_parse_from(["tether", "probe", "127.0.0.1:4760"]).unwrap();
        match cli.command {
            Commands::Probe {
                addr,
                mimetype,
                args,
                keep,
            } => {
                assert_eq!(addr.port(), 4760);
                assert_eq!(mimetype, "toolkit");
                assert_eq!(args, "{}");
                assert!(!keep);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["tether", "probe", "127.0.0.1:1", "--config", "/tmp/t.toml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
    }

    #[test]
    fn test_probe_rejects_bad_addr() {
        assert!(Cli::try_parse_from(["tether", "probe", "not-an-addr"]).is_err());
    }
}
