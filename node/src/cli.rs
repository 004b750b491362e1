//! # CLI Interface
//!
//! Command-line arguments for `harvest-node`, via `clap` derive. Every flag
//! that an operator sets per deployment also reads a `HARVEST_*` variable.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use harvest_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};

/// Harvest wallet ledger authority.
///
/// Serves the sync API that field devices submit transactions to, and the
/// read API for wallet state and history.
#[derive(Parser, Debug)]
#[command(
    name = "harvest-node",
    about = "Harvest wallet ledger authority",
    version,
    propagate_version = true
)]
pub struct HarvestNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the authority service.
    Serve(ServeArgs),
    /// Load wallets, geofences and issuer keys from a JSON file. Run while
    /// the service is stopped: the store allows one process at a time.
    Provision(ProvisionArgs),
    /// Query a running authority's status endpoint.
    Status(StatusArgs),
    /// Generate a credential issuer keypair.
    Keygen,
    /// Mint a QR credential token.
    Credential(CredentialArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Log output format.
    #[arg(long, env = "HARVEST_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Default filter when `RUST_LOG` is unset.
    #[arg(
        long,
        env = "HARVEST_LOG_LEVEL",
        default_value = "harvest_node=info,harvest_protocol=info,tower_http=info"
    )]
    pub log_level: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Directory holding the authority store. Created on first run.
    #[arg(long, short = 'd', env = "HARVEST_DATA_DIR", default_value = "./harvest-data")]
    pub data_dir: PathBuf,

    /// Address to bind both listeners on.
    #[arg(long, env = "HARVEST_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port for the sync and read API.
    #[arg(long, env = "HARVEST_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "HARVEST_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    #[command(flatten)]
    pub log: LogArgs,
}

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    #[arg(long, short = 'd', env = "HARVEST_DATA_DIR", default_value = "./harvest-data")]
    pub data_dir: PathBuf,

    /// Provisioning file (JSON).
    #[arg(long, short = 'f')]
    pub file: PathBuf,

    #[command(flatten)]
    pub log: LogArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Base URL of the running authority.
    #[arg(long, env = "HARVEST_URL", default_value = "http://127.0.0.1:9841")]
    pub url: String,
}

#[derive(Args, Debug)]
pub struct CredentialArgs {
    /// Hex-encoded issuer secret key (from `keygen`).
    #[arg(long, env = "HARVEST_ISSUER_KEY", hide_env_values = true)]
    pub issuer_key: String,

    /// Merchant the credential identifies.
    #[arg(long, conflicts_with = "wallet", required_unless_present = "wallet")]
    pub merchant: Option<String>,

    /// Wallet the credential identifies.
    #[arg(long)]
    pub wallet: Option<String>,

    /// Scanning context the credential is valid in, usually the co-op id.
    #[arg(long)]
    pub audience: String,

    /// Validity window in seconds.
    #[arg(long, default_value_t = 300)]
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        HarvestNodeCli::command().debug_assert();
    }

    #[test]
    fn serve_defaults() {
        let cli = HarvestNodeCli::parse_from(["harvest-node", "serve"]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.api_port, DEFAULT_API_PORT);
                assert_eq!(args.metrics_port, DEFAULT_METRICS_PORT);
                assert_eq!(args.log.log_format, LogFormatArg::Pretty);
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn credential_needs_a_subject() {
        let res = HarvestNodeCli::try_parse_from([
            "harvest-node",
            "credential",
            "--issuer-key",
            "00",
            "--audience",
            "coop",
        ]);
        assert!(res.is_err());
    }
}
