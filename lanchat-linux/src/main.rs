// LanChat Linux: presence, chat server and offline queue daemon with a console session.

use std::sync::Arc;

use lanchat_linux::{config, console, Node, NodeEvent};
use tokio_util::sync::CancellationToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut headless = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanchat-linux {}", VERSION);
                return Ok(());
            }
            "--headless" => headless = true,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (node, events) = Node::start(cfg).await?;
        let node = Arc::new(node);
        let cancel = CancellationToken::new();

        if headless {
            tokio::spawn(log_events(events));
            shutdown_signal().await?;
        } else {
            tokio::select! {
                r = console::run_console(node.clone(), events, cancel.clone()) => r?,
                r = shutdown_signal() => r?,
            }
        }
        cancel.cancel();
        node.shutdown().await;
        anyhow::Ok(())
    })
}

/// Without a console nobody reads events; keep them in the log instead.
async fn log_events(mut events: tokio::sync::mpsc::UnboundedReceiver<NodeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::MessageReceived { from, content } => log::info!("{from}: {content}"),
            NodeEvent::Delivery {
                sequence,
                destination,
                outcome,
            } => log::info!("message #{sequence} to {destination}: {outcome:?}"),
            other => log::debug!("{other:?}"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
