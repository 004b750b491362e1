// Copyright (c) 2026 Harvest Co-op Engineering. MIT License.
// See LICENSE for details.

//! # Harvest Authority Node
//!
//! Entry point for the `harvest-node` binary. Parses CLI arguments,
//! initializes logging and metrics, and serves the sync API.
//!
//! Subcommands:
//!
//! - `serve`      start the authority
//! - `provision`  load wallets, geofences and issuer keys into the store
//! - `status`     query a running authority's status endpoint
//! - `keygen`     generate a credential issuer keypair
//! - `credential` mint a QR credential token
//! - `version`    print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod provisioning;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use harvest_protocol::credential::{CredentialIssuer, CredentialSubject};
use harvest_protocol::crypto::IssuerKeypair;
use harvest_protocol::ledger::WalletLedgerAuthority;
use harvest_protocol::storage::AuthorityDb;
use harvest_protocol::sync::SyncService;
use harvest_protocol::transaction::{MerchantId, WalletId};

use cli::{Commands, HarvestNodeCli};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = HarvestNodeCli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Provision(args) => provision(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Keygen => {
            keygen();
            Ok(())
        }
        Commands::Credential(args) => mint_credential(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn open_authority(data_dir: &Path) -> Result<Arc<WalletLedgerAuthority>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    let db_path = data_dir.join("db");
    let db = AuthorityDb::open(&db_path)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    Ok(Arc::new(WalletLedgerAuthority::new(Arc::new(db))))
}

/// Runs the authority: sync and read API plus the metrics endpoint.
async fn serve(args: cli::ServeArgs) -> Result<()> {
    logging::init_from_args(&args.log);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %args.data_dir.display(),
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        "starting harvest-node"
    );

    let authority = open_authority(&args.data_dir)?;
    let wallets = authority.db().wallet_count();
    let decisions = authority.db().decision_count();
    tracing::info!(wallets, decisions, "store opened");

    let metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    metrics.wallets_provisioned.set(wallets as i64);

    let state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: Arc::new(SyncService::new(authority.clone())),
        metrics: metrics.clone(),
        started_at: Utc::now(),
    };

    let api_router = api::create_router(state);
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(metrics);

    let api_addr = format!("{}:{}", args.bind, args.api_port);
    let metrics_addr = format!("{}:{}", args.bind, args.metrics_port);

    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API on {api_addr}"))?;
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics on {metrics_addr}"))?;

    tracing::info!(%api_addr, "API listening");
    tracing::info!(%metrics_addr, "metrics listening");

    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    authority.db().flush().context("failed to flush store")?;
    tracing::info!("harvest-node stopped");
    Ok(())
}

/// Applies a provisioning file to the store and prints what changed.
fn provision(args: cli::ProvisionArgs) -> Result<()> {
    logging::init_from_args(&args.log);

    let file = provisioning::load(&args.file)?;
    let authority = open_authority(&args.data_dir)?;
    let report = provisioning::apply(&authority, &file)?;
    authority.db().flush().context("failed to flush store")?;

    tracing::info!(
        issuers = report.issuers,
        geofences = report.geofences,
        created = report.wallets_created.len(),
        updated = report.wallets_updated,
        "provisioning applied"
    );

    println!("Provisioning applied.");
    println!("  Trusted issuers : {}", report.issuers);
    println!("  Geofences       : {}", report.geofences);
    println!("  Wallets updated : {}", report.wallets_updated);
    println!("  Wallets created : {}", report.wallets_created.len());
    for id in &report.wallets_created {
        println!("    {id}");
    }
    Ok(())
}

/// Queries a running authority's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()
        .with_context(|| format!("{url} returned an error"))?;
    let status: api::StatusResponse = resp.json().await.context("invalid status response")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn keygen() {
    let keypair = IssuerKeypair::generate();
    println!("secret_key : {}", keypair.secret_key_hex());
    println!("public_key : {}", keypair.public_key());
}

fn mint_credential(args: cli::CredentialArgs) -> Result<()> {
    let keypair = IssuerKeypair::from_hex(&args.issuer_key).context("invalid issuer key")?;
    let subject = match (args.merchant, args.wallet) {
        (Some(merchant), _) => CredentialSubject::Merchant(MerchantId::new(merchant)),
        (None, Some(wallet)) => {
            let id: WalletId = wallet
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid wallet id: {wallet}"))?;
            CredentialSubject::Wallet(id)
        }
        (None, None) => anyhow::bail!("either --merchant or --wallet is required"),
    };
    let token = CredentialIssuer::new(keypair)
        .issue(
            subject,
            &args.audience,
            Duration::from_secs(args.ttl_secs),
            Utc::now(),
        )
        .context("failed to issue credential")?;
    println!("{token}");
    Ok(())
}

fn print_version() {
    println!("harvest-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", harvest_protocol::config::PROTOCOL_VERSION);
    println!("wire         {}", harvest_protocol::config::WIRE_PROTOCOL_VERSION);
    println!("rustc        {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
