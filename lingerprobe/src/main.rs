//! Entry point for `lingerprobe`.
//!
//! Parses CLI arguments, installs logging and the interrupt handler, runs the
//! engine and reports how each role exited. All protocol work lives in the
//! library.

use clap::Parser;
use lingerprobe::{EngineBuilder, Report, SendFailurePolicy};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

/// Loopback TCP client/server rig for observing linger and abrupt-close
/// behaviour.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Force-close the server's sockets while an accept is outstanding.
    #[arg(long)]
    abrupt_close: bool,

    /// Close the accepted connection directly instead of disconnecting it.
    #[arg(long)]
    no_graceful_disconnect: bool,

    /// Server idle wait in milliseconds.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    server_tick_ms: u64,

    /// Client idle wait in milliseconds.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    client_tick_ms: u64,

    /// What the client does when a send fails: retry or fatal.
    #[arg(long, default_value = "retry")]
    send_failure: SendFailurePolicy,

    /// Stop sending after this many messages.
    #[arg(long)]
    messages: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn describe(outcome: &lingerprobe::Result<()>) -> String {
    match outcome {
        Ok(()) => "success".into(),
        Err(err) => format!("failure ({err})"),
    }
}

fn report(report: &Report) {
    log::info!("Server thread exited with {}", describe(&report.server));
    log::info!("Client thread exited with {}", describe(&report.client));

    let contexts = report.contexts;
    if contexts.is_balanced() {
        log::info!("{} operation contexts allocated, all freed", contexts.allocated);
    } else {
        log::error!(
            "operation contexts unbalanced: {} allocated, {} freed, {} live, {} double frees",
            contexts.allocated,
            contexts.freed,
            contexts.live,
            contexts.double_frees
        );
    }
}

fn main() -> ExitCode {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut builder = EngineBuilder::new()
        .abrupt_close(cli.abrupt_close)
        .graceful_disconnect(!cli.no_graceful_disconnect)
        .server_tick(Duration::from_millis(cli.server_tick_ms))
        .client_tick(Duration::from_millis(cli.client_tick_ms))
        .send_failure(cli.send_failure);
    if let Some(messages) = cli.messages {
        builder = builder.message_limit(messages);
    }

    let engine = builder.build();
    let liveness = engine.liveness();

    let interrupted = liveness.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        log::info!("interrupted, stopping");
        interrupted.stop();
    }) {
        log::error!("failed to install the interrupt handler: {err}");
        return ExitCode::FAILURE;
    }

    let handle = match engine.start() {
        Ok(handle) => handle,
        Err(err) => {
            log::error!("failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };

    let deadline = cli
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    while liveness.is_alive() && !handle.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            liveness.stop();
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    handle.stop();
    let outcome = handle.join();
    report(&outcome);

    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
