//! Background daemon that locks the host while no authorized USB device is attached.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio::{select, signal};
use usbgate_core::{
    config::{config_path_from_env, UsbgateConfig},
    logging, periodic_sync, ChannelPresenter, CommandShutdown, GateService, LockController,
    Registry, RemoteSynchronizer,
};

mod screen;

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Command-line options for the gate daemon.
#[derive(Parser, Debug)]
#[command(
    name = "usbgated",
    version,
    about = "Locks and eventually powers off the host when no authorized USB device is attached."
)]
struct Args {
    /// Path to the usbgate configuration file (defaults to $USBGATE_CONFIG or /etc/usbgate.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Entry point for the Tokio runtime; logs failures before exit.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

/// Load configuration, seed the registry, start background tasks, and wait for a signal.
async fn run() -> Result<()> {
    logging::init("info");
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(config_path_from_env);
    let config = UsbgateConfig::load_or_bootstrap(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    if config.path != config_path {
        warn!(
            "configuration missing at {}; using bootstrap at {}",
            config_path.display(),
            config.path.display()
        );
    }

    info!("usbgate daemon booting (config: {})", config.path.display());

    let registry = Arc::new(Registry::load(config.store_path()));

    let remote = RemoteSynchronizer::from_config(&config).context("initialise remote sync")?;
    if remote.is_enabled() {
        remote.sync_into(&registry).await;
    } else {
        info!("remote sync disabled; relying on {} local device(s)", registry.len());
    }

    let (presenter, screen_rx) = ChannelPresenter::channel();
    let shutdown = CommandShutdown::from_config(&config.shutdown).context("configure shutdown")?;
    let controller = Arc::new(LockController::new(
        registry.clone(),
        Arc::new(presenter),
        Arc::new(shutdown),
        config.lock.grace_secs,
    ));

    let lister = usbgate_usb::system_lister(config.query_timeout());
    let service = Arc::new(GateService::from_config(
        controller.clone(),
        lister,
        &config,
    ));

    let screen_handle = tokio::spawn(screen::run(screen_rx));
    let gate_handle = tokio::spawn(service.run());

    if let Some(every) = config.remote_refresh() {
        if remote.is_enabled() {
            tokio::spawn(periodic_sync(remote, registry.clone(), every));
        }
    }

    if let Some(addr) = config.status_addr() {
        tokio::spawn(async move {
            if let Err(err) = status_server(addr, controller).await {
                warn!("status endpoint stopped: {err:?}");
            }
        });
    }

    select! {
        res = gate_handle => res.context("gate task")?,
        res = screen_handle => res.context("lock screen task")?,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Expose the gate state as a bare-bones plain-text HTTP endpoint.
async fn status_server(addr: SocketAddr, controller: Arc<LockController>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind status endpoint {addr}"))?;
    info!("status endpoint listening on http://{addr}");
    serve_status(listener, controller).await
}

async fn serve_status(listener: TcpListener, controller: Arc<LockController>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = answer_status(stream, &controller).await {
                warn!("failed to respond to {peer}: {err}");
            }
        });
    }
}

async fn answer_status(mut stream: TcpStream, controller: &LockController) -> io::Result<()> {
    read_request_head(&mut stream).await?;
    let body = controller.status().to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Consume the request line and headers; unread input makes the close a reset.
async fn read_request_head(stream: &mut TcpStream) -> io::Result<()> {
    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 512];
    let read = async {
        while head.len() < MAX_REQUEST_HEAD && !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        Ok::<(), io::Error>(())
    };
    match timeout(REQUEST_READ_TIMEOUT, read).await {
        Ok(result) => result,
        Err(_) => {
            debug!("status request head not complete after {REQUEST_READ_TIMEOUT:?}; answering anyway");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;
    use usbgate_core::{GateResult, ShutdownAction};

    struct NoShutdown;

    impl ShutdownAction for NoShutdown {
        fn shutdown(&self) -> GateResult<()> {
            Ok(())
        }
    }

    async fn fetch_status(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /status HTTP/1.1\r\nhost: localhost\r\naccept: */*\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn status_endpoint_reports_gate_state() {
        let dir = tempdir().unwrap();
        let (presenter, _screen_rx) = ChannelPresenter::channel();
        let controller = Arc::new(LockController::new(
            Arc::new(Registry::load(dir.path().join("allowed_serials.json"))),
            Arc::new(presenter),
            Arc::new(NoShutdown),
            160,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_status(listener, Arc::clone(&controller)));

        let response = fetch_status(addr).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nUNLOCKED"));

        controller.evaluate(&BTreeSet::new());
        assert!(fetch_status(addr).await.ends_with("\r\n\r\nLOCKED 160"));
    }
}
