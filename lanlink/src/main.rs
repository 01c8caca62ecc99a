// lanlink daemon: joins the LAN, logs peers and broadcasts, echoes messages.

use anyhow::Context;
use lanlink::{Handlers, P2PMessage, Socket};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lanlink {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = lanlink::config::load().context("loading config")?;

    let handlers = Handlers::new()
        .on_receive_hello(|req| {
            info!(node = %req.sender, addr = %req.remote_address, "hello");
        })
        .on_connect_node(|node, addr| {
            info!(%node, %addr, "connected");
        })
        .on_receive_broadcast(|req| {
            info!(node = %req.sender, len = req.message.len(), "broadcast");
        })
        .on_receive_datagram(|req| {
            info!(node = %req.sender, len = req.message.len(), "datagram");
        })
        .on_receive_message(|req| {
            info!(node = %req.sender, len = req.message.len(), "message");
            P2PMessage::new(req.message.bytes())
        });

    let socket = Socket::open(cfg, handlers).context("opening socket")?;
    socket.start().context("starting socket")?;
    if socket.generated_key() {
        info!("no key configured; generated a new identity for this run");
    }
    info!(
        node = %socket.local_node_id(),
        port = socket.bound_port(),
        control = socket.control_port(),
        "lanlink running"
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    rt.block_on(shutdown_signal())?;
    socket.close();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}
