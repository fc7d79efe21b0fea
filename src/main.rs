//! ptygate - authenticated WebSocket gateway for PTY sessions.
//!
//! `ptygate serve` (the default) starts the HTTP/WebSocket listener.
//! `ptygate token --user <id>` prints a signed access token.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser as ClapParser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ptygate::{
    api,
    audit::{Auditor, TracingAuditSink},
    auth::TokenGate,
    config::GatewayConfig,
    hub::Hub,
    pty::{PtyManager, PtyWriter},
    rpc::PtyRpcService,
    server, tls,
};

const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// ptygate - authenticated WebSocket gateway for PTY sessions
#[derive(ClapParser, Debug)]
#[command(name = "ptygate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway (default when no subcommand is given)
    Serve(ServeArgs),

    /// Issue a signed access token and print it to stdout
    Token {
        /// User id to embed in the token
        #[arg(long)]
        user: String,

        /// Validity in hours (defaults to the config file value, then 24)
        #[arg(long)]
        hours: Option<i64>,

        /// HMAC secret used to sign the token
        #[arg(long, env = "PTYGATE_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Path to the TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// HMAC secret used to verify tokens
    #[arg(long, env = "PTYGATE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Shell to spawn for new PTYs (overrides $SHELL)
    #[arg(long)]
    shell: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Token {
            user,
            hours,
            secret,
            config,
        }) => run_token(user, hours, secret, config.as_deref()),
        Some(Commands::Serve(args)) => {
            init_tracing();
            run_serve(args).await
        }
        None => {
            init_tracing();
            run_serve(cli.serve).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ptygate=info,audit=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Explicit path, else the default location. Missing file means defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match GatewayConfig::default_path() {
            Some(path) => path,
            None => return Ok(GatewayConfig::default()),
        },
    };
    let config = GatewayConfig::load_or_default(&path)?;
    tracing::debug!(path = %path.display(), "config resolved");
    Ok(config)
}

fn run_token(
    user: String,
    hours: Option<i64>,
    secret: Option<String>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let Some(secret) = secret.or(config.auth.secret) else {
        bail!("no secret configured: pass --secret, set PTYGATE_SECRET, or add [auth] secret");
    };
    let hours = hours.unwrap_or(config.auth.token_validity_hours);
    let token = TokenGate::new(secret, hours)
        .issue(&user)
        .context("failed to issue token")?;
    println!("{token}");
    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    let bind = match args.bind.or(config.bind) {
        Some(bind) => bind,
        None => DEFAULT_BIND.parse()?,
    };

    let tls_paths = match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => Some((cert, key)),
        (None, None) => config.tls.clone().map(|t| (t.cert, t.key)),
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };
    let acceptor = tls_paths
        .map(|(cert, key)| tls::load_tls_config(&cert, &key))
        .transpose()
        .context("failed to load TLS material")?;

    let auditor = Auditor::new();
    auditor.set_sink(Arc::new(TracingAuditSink));

    let gate = match args.secret.or(config.auth.secret.clone()) {
        Some(secret) if !secret.is_empty() => {
            Some(TokenGate::new(secret, config.auth.token_validity_hours))
        }
        _ => {
            tracing::warn!("no token secret configured; /ws and /rpc will refuse every request");
            None
        }
    };

    let hub = Hub::spawn_with_capacity(config.websocket.outbound_capacity);
    let manager = PtyManager::new(hub.clone(), args.shell.or(config.pty.shell.clone()));

    let state = api::AppState {
        hub: hub.clone(),
        pty: Some(Arc::new(manager.clone())),
        gate,
        auditor,
        connection: config.websocket,
        rpc: Some(Arc::new(PtyRpcService::new(manager.clone()))),
    };
    let app = api::router(state);

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        tls = acceptor.is_some(),
        "ptygate listening"
    );

    let shutdown = CancellationToken::new();
    let mut server_handle = tokio::spawn(server::serve(listener, app, acceptor, shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
        }
        result = &mut server_handle => {
            // The listener only stops on its own when something failed.
            result.context("server task panicked")??;
            bail!("server stopped unexpectedly");
        }
    }

    shutdown.cancel();
    hub.shutdown(config.shutdown_timeout()).await;

    for info in manager.list() {
        if let Err(e) = manager.kill_pty(&info.id) {
            tracing::debug!(session = %info.id, ?e, "failed to kill pty on shutdown");
        }
    }

    match tokio::time::timeout(config.shutdown_timeout(), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(?e, "server exited with error"),
        Ok(Err(e)) => tracing::warn!(?e, "server task panicked"),
        Err(_) => tracing::warn!("server did not stop before the shutdown deadline"),
    }

    tracing::info!("ptygate exiting");
    Ok(())
}
