//! CLI harness around the matching core.
//!
//! ```text
//! perpcored <config.json> [serve|verify]
//! ```
//!
//! `serve` (default) recovers state and runs the periodic funding and
//! liquidation sweeps; `verify` recovers state, prints the state digest
//! and exits. Exit codes: 0 normal shutdown, 2 config error, 3 WAL
//! unreadable below the committed high-water mark, 4 invariant
//! violation during replay, 5 other persistence failure.

use perpcore_rs::control::config::CoreConfig;
use perpcore_rs::control::{Controller, CoreError};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    std::process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    let Some(config_path) = args.get(1) else {
        eprintln!("usage: perpcored <config.json> [serve|verify]");
        return 2;
    };
    let mode = args.get(2).map(String::as_str).unwrap_or("serve");

    let config = match CoreConfig::from_json_file(Path::new(config_path)) {
        Ok(config) => config,
        Err(message) => {
            error!("{message}");
            return 2;
        }
    };
    let instrument_ids: Vec<_> = config
        .instruments
        .iter()
        .map(|i| i.instrument_id)
        .collect();

    let core = match Controller::open(config) {
        Ok(core) => core,
        Err(err) => {
            error!("startup failed: {err}");
            return err.exit_code();
        }
    };

    match mode {
        "verify" => {
            info!(
                "recovered to sequence {} (digest {})",
                core.wal().committed_sequence(),
                core.state_digest()
            );
            0
        }
        "serve" => serve(&core, &instrument_ids),
        other => {
            eprintln!("unknown mode: {other}");
            2
        }
    }
}

fn serve(core: &Controller, instrument_ids: &[perpcore_rs::InstrumentId]) -> i32 {
    info!("serving {} instrument(s)", instrument_ids.len());
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let now_ns = perpcore_rs::current_time_nanos();
        if let Err(err) = core.poll_funding(now_ns) {
            if let Some(code) = fatal_code(&err) {
                error!("funding sweep failed fatally: {err}");
                return code;
            }
            error!("funding sweep failed: {err}");
        }
        for &instrument_id in instrument_ids {
            match core.run_liquidations(instrument_id) {
                Ok(outcomes) if !outcomes.is_empty() => {
                    info!("liquidated {} position(s)", outcomes.len());
                }
                Ok(_) => {}
                Err(err) => {
                    if let Some(code) = fatal_code(&err) {
                        error!("liquidation sweep failed fatally: {err}");
                        return code;
                    }
                    error!("liquidation sweep failed: {err}");
                }
            }
        }
    }
}

fn fatal_code(err: &CoreError) -> Option<i32> {
    match err {
        CoreError::Wal(_) | CoreError::ReplayInvariant(_) | CoreError::Overflow => {
            Some(err.exit_code())
        }
        _ => None,
    }
}
