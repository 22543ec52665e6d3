//! `fulcrum`: chat with a simulated assistant from the terminal.
//!
//! Every line typed on stdin starts an exchange against an in-process
//! message store. Store changes arrive through the change feed and the
//! direct write path and are printed as they are reconciled. Configuration
//! via CLI flags, environment variables, or config file
//! (`~/.config/fulcrum/config.toml`).
//!
//! ```bash
//! cargo run --bin fulcrum
//!
//! # Instant replies, verbose log
//! cargo run --bin fulcrum -- --ack-delay-ms 0 --think-min-ms 0 --log-level debug
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use fulcrum::app::{App, HELP, Input};
use fulcrum::chat::SendRejected;
use fulcrum::chat::delay::SimulatedDelays;
use fulcrum::config::{CliArgs, ClientConfig};
use fulcrum::engine::Engine;
use fulcrum::persistence::memory::InMemoryBackend;

type FulcrumEngine = Engine<InMemoryBackend, SimulatedDelays>;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // Logs go to a file so stdout carries only the conversation. Set up
    // before the config is resolved so its warnings are kept.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            tracing::warn!(error = %e, "config load failed, using defaults");
            ClientConfig::default()
        }
    };

    tracing::info!("fulcrum starting");

    let backend = InMemoryBackend::new();
    let (engine, events) = Engine::init(
        Arc::new(backend.clone()),
        config.to_engine_config(),
        config.to_delays(),
    );

    let result = run(&engine, &backend, events, &config).await;

    engine.teardown().await;
    tracing::info!("fulcrum exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("fulcrum.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Main input/output loop.
async fn run(
    engine: &FulcrumEngine,
    backend: &InMemoryBackend,
    mut events: mpsc::Receiver<fulcrum::sync::StoreEvent>,
    config: &ClientConfig,
) -> io::Result<()> {
    let mut app = App::new(config.timestamp_format.clone());
    let mut connectivity = engine.subscribe_connectivity();
    let mut processing = engine.subscribe_processing();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Exchange failures that leave no status change behind are reported here.
    let (failure_tx, mut failures) = mpsc::channel::<String>(8);

    println!("{HELP}");
    println!("-- {} --", app.placeholder());

    while !app.should_quit {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                handle_input(&mut app, engine, backend, &failure_tx, Input::parse(&line))?;
            }
            Some(event) = events.recv() => {
                if let Some(line) = app.render_event(&event, &engine.snapshot()) {
                    println!("{line}");
                }
            }
            Ok(()) = connectivity.changed() => {
                let state = *connectivity.borrow_and_update();
                if let Some(line) = app.set_connectivity(state) {
                    println!("{line}");
                    if let Some(welcome) = app.welcome(&engine.snapshot()) {
                        for text in welcome {
                            println!("   {text}");
                        }
                    }
                    println!("-- {} --", app.placeholder());
                }
            }
            Ok(()) = processing.changed() => {
                let busy = *processing.borrow_and_update();
                app.set_processing(busy);
                println!("-- {} --", app.placeholder());
            }
            Some(failure) = failures.recv() => {
                println!("! {failure}");
            }
        }
    }

    Ok(())
}

fn handle_input(
    app: &mut App,
    engine: &FulcrumEngine,
    backend: &InMemoryBackend,
    failure_tx: &mpsc::Sender<String>,
    input: Input,
) -> io::Result<()> {
    match input {
        Input::Quit => app.should_quit = true,
        Input::Help => println!("{HELP}"),
        Input::Unknown(cmd) => println!("unknown command {cmd}; {HELP}"),
        Input::History => {
            for message in engine.snapshot() {
                println!("{}", app.render_message(&message));
            }
        }
        Input::Dump => {
            let json = serde_json::to_string_pretty(&engine.snapshot()).map_err(io::Error::other)?;
            println!("{json}");
        }
        Input::DropFeed => {
            backend.drop_subscriptions();
            println!("* feed subscription dropped");
        }
        Input::Text(text) => {
            if !app.can_send() {
                println!("-- {} --", app.placeholder());
                return Ok(());
            }
            match engine.send_message(&text) {
                Ok(handle) => {
                    let tx = failure_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle.outcome().await {
                            let _ = tx.send(e.to_string()).await;
                        }
                    });
                }
                Err(SendRejected::EmptyText) => {}
                Err(e) => println!("! {e}"),
            }
        }
    }
    Ok(())
}
