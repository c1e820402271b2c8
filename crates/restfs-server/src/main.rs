//! Serve per-user directories over the restfs HTTP protocol.
//!
//! Every immediate subdirectory of `--root` is one user's store; requests authenticate as a user by
//! naming them in the `Authorization` header.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use restfs::sandbox::UserStore;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Serve sandboxed per-user directories over HTTP.")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "RESTFS_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Directory holding one subdirectory per user.
    #[arg(long, env = "RESTFS_ROOT", default_value = "./store")]
    root: PathBuf,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutting down");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let filter = EnvFilter::try_from_env("RESTFS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    match tokio::fs::metadata(&args.root).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            error!(root = %args.root.display(), "store root exists but is not a directory");
            std::process::exit(1);
        }
        Err(e) => {
            error!(root = %args.root.display(), error = %e, "store root is not accessible");
            std::process::exit(1);
        }
    }

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(root = %args.root.display(), "listening on {}", listener.local_addr()?);
    restfs::server::serve(listener, UserStore::new(args.root), shutdown_signal()).await
}
