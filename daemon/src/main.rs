mod client;
mod config;
mod render;
mod session;
mod state;
mod subscription;
mod terminal;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use maestro_transcript::terminal::DEFAULT_SCROLLBACK;
use maestro_transcript::TerminalBuffer;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use client::OpenCodeClient;
use config::{Args, Command, SyncConfig};
use render::Renderer;
use session::SessionView;
use state::SessionState;
use subscription::{ConsumeOutcome, SubscriptionManager};
use terminal::{spawn_input_pump, spawn_output_pump, TerminalHandle};

/// Backoff durations for event stream reconnection
const BACKOFF_DELAYS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// How long `send` keeps following events after the prompt request returns.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

const TERMINAL_COLS: u16 = 120;
const TERMINAL_ROWS: u16 = 40;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let data_dir = args.data_dir();
    let file_config = SyncConfig::load(&data_dir)?;
    let settings = args.resolve(file_config);
    info!("OpenCode server: {}", settings.server);

    let client = OpenCodeClient::new(settings.server, settings.directory);

    match args.command {
        Command::Sessions => {
            let sessions = client.list_sessions().await?;
            for session in sessions {
                println!("{}\t{}", session.id, session.title);
            }
        }
        Command::New { title } => {
            let session = client.create_session(title.as_deref()).await?;
            println!("{}", session.id);
        }
        Command::Watch { session } => watch_session(client, &session).await?,
        Command::Send { session, message } => send_prompt(client, &session, &message).await?,
        Command::Abort { session } => {
            client.abort(&session).await?;
            info!("Aborted session {}", session);
        }
        Command::Run { cwd, command } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir().context("Failed to resolve working directory")?,
            };
            run_terminal(&cwd, &command).await?;
        }
    }

    Ok(())
}

/// Print whatever the renderer has not shown yet.
async fn print_updates(state: &SessionState, renderer: &mut Renderer) {
    if let Some(text) = state.read(|t| renderer.update(t)).await {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }
}

fn finish_output(renderer: &mut Renderer) {
    if let Some(end) = renderer.finish() {
        print!("{end}");
        let _ = std::io::stdout().flush();
    }
}

async fn print_changes(
    state: &SessionState,
    changes: &mut watch::Receiver<u64>,
    renderer: &mut Renderer,
) {
    while changes.changed().await.is_ok() {
        print_updates(state, renderer).await;
    }
}

/// Follow the view's current subscription until it stops.
async fn follow(view: &mut SessionView, renderer: &mut Renderer) -> ConsumeOutcome {
    let state = view.state().clone();
    let mut changes = view.changes();
    print_updates(&state, renderer).await;

    let outcome = tokio::select! {
        outcome = view.finished() => outcome,
        _ = print_changes(&state, &mut changes, renderer) => ConsumeOutcome::Ended,
    };
    print_updates(&state, renderer).await;
    outcome
}

async fn watch_session(client: OpenCodeClient, session_id: &str) -> anyhow::Result<()> {
    let manager = Arc::new(SubscriptionManager::new());
    let mut view = SessionView::open(client, manager.clone(), session_id)
        .await
        .with_context(|| format!("Failed to open session {session_id}"))?;
    let mut renderer = Renderer::new();
    let mut attempt = 0usize;

    loop {
        let outcome = tokio::select! {
            outcome = follow(&mut view, &mut renderer) => outcome,
            _ = tokio::signal::ctrl_c() => ConsumeOutcome::Cancelled,
        };

        match outcome {
            ConsumeOutcome::Cancelled => break,
            ConsumeOutcome::Ended | ConsumeOutcome::Failed(_) => {
                warn!(
                    "Event stream for {} stopped ({:?}), reconnecting...",
                    session_id, outcome
                );
            }
        }

        loop {
            let delay = BACKOFF_DELAYS
                .get(attempt)
                .copied()
                .unwrap_or(BACKOFF_DELAYS[BACKOFF_DELAYS.len() - 1]);
            attempt = (attempt + 1).min(BACKOFF_DELAYS.len() - 1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => {
                    finish_output(&mut renderer);
                    manager.shutdown().await;
                    return Ok(());
                }
            }

            match view.reconnect().await {
                Ok(()) => {
                    info!("Reconnected to session {}", session_id);
                    attempt = 0;
                    break;
                }
                Err(e) => warn!("Reconnect failed for {}: {}", session_id, e),
            }
        }
    }

    finish_output(&mut renderer);
    view.close().await;
    manager.shutdown().await;
    Ok(())
}

async fn send_prompt(client: OpenCodeClient, session_id: &str, message: &str) -> anyhow::Result<()> {
    let manager = Arc::new(SubscriptionManager::new());
    let mut view = SessionView::open(client, manager.clone(), session_id)
        .await
        .with_context(|| format!("Failed to open session {session_id}"))?;
    let state = view.state().clone();
    let mut changes = view.changes();
    let mut renderer = Renderer::new();

    let sent = tokio::select! {
        sent = view.send_prompt(message) => sent,
        _ = print_changes(&state, &mut changes, &mut renderer) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, aborting session {}", session_id);
            view.abort().await?;
            Ok(())
        }
    };

    if sent.is_ok() {
        // The reply's last events can trail the prompt response
        let settle = async {
            while view.is_streaming().await {
                if changes.changed().await.is_err() {
                    break;
                }
                print_updates(&state, &mut renderer).await;
            }
        };
        if tokio::time::timeout(SETTLE_TIMEOUT, settle).await.is_err() {
            warn!("Session {} still streaming, detaching", session_id);
        }
    }

    print_updates(&state, &mut renderer).await;
    finish_output(&mut renderer);
    view.close().await;
    manager.shutdown().await;
    sent.with_context(|| format!("Prompt for session {session_id} failed"))
}

async fn run_terminal(cwd: &std::path::Path, command: &[String]) -> anyhow::Result<()> {
    let (handle, reader) = TerminalHandle::open(cwd, TERMINAL_COLS, TERMINAL_ROWS, command)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pump = spawn_output_pump(reader, tx);
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    spawn_input_pump(input_tx);
    let mut buffer = TerminalBuffer::new(DEFAULT_SCROLLBACK);

    loop {
        tokio::select! {
            Some(input) = input_rx.recv() => {
                if let Err(e) = handle.write(&input).await {
                    warn!("Failed to forward input: {e}");
                }
            }
            chunk = rx.recv() => match chunk {
                Some(bytes) => {
                    buffer.push_bytes(&bytes);
                    for line in buffer.take_completed() {
                        println!("{line}");
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, killing terminal process");
                handle.kill().await;
            }
        }
    }

    let code = handle.wait_exit().await;
    buffer.mark_exited(code);
    if let Err(e) = pump.await {
        warn!("Output pump failed: {e}");
    }

    let tail = buffer.current_line();
    if !tail.is_empty() {
        println!("{tail}");
    }
    match code {
        Some(code) => info!("Process exited with status {}", code),
        None => info!("Process exited"),
    }
    Ok(())
}
