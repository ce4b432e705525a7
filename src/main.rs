use anyhow::{Context, Result};
use futures::StreamExt;
use std::io::Write;
use talkback::{BackendConfig, BackendKind, Coordinator, CoordinatorConfig, CoordinatorEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: talkback <config.toml | two_phase | streaming | subprocess>";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for spoken output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkback=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let arg = std::env::args().nth(1).context(USAGE)?;
    // A bare backend name runs that backend with default settings
    let config = match arg.parse::<BackendKind>() {
        Ok(kind) => CoordinatorConfig::new(BackendConfig::for_kind(kind)),
        Err(_) => CoordinatorConfig::load(&arg)
            .with_context(|| format!("failed to load configuration from {}", arg))?,
    };

    info!(backend = %config.backend.kind(), "Starting talkback console");
    let coordinator = Coordinator::start(config)?;
    info!(session = %coordinator.session().backend, "session ready");

    // Observer thread; ends when the coordinator drops its sender
    let events = coordinator.event_receiver();
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                CoordinatorEvent::ToolExecution { tool, .. } => info!(%tool, "tool running"),
                CoordinatorEvent::SessionStateChanged(state) => info!(?state, "session"),
                other => debug!(event = ?other, "coordinator event"),
            }
        }
    });

    eprintln!("Type an utterance and press enter. /interrupt interrupts, /quit exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/interrupt" => coordinator.signal_interruption(),
            utterance => {
                let turn = coordinator.submit_utterance(utterance);
                let mut output = Box::pin(coordinator.drain_turn(&turn));
                tokio::spawn(async move {
                    while let Some(chunk) = output.next().await {
                        print!("{}", chunk);
                        let _ = std::io::stdout().flush();
                    }
                    println!();
                });
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
