//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `fireball_core` linkage.
//! - With a data directory argument, run one fetch-and-ingest cycle against
//!   the live feed and print record counts.

use fireball_core::{SyncConfig, SyncController};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

const REPLAY_WAIT: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    println!("fireball_core ping={}", fireball_core::ping());
    println!("fireball_core version={}", fireball_core::core_version());

    let Some(data_dir) = std::env::args().nth(1) else {
        return ExitCode::SUCCESS;
    };
    match run_cycle(&data_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("fireball_cli error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run_cycle(data_dir: &str) -> Result<(), String> {
    let controller =
        SyncController::open(SyncConfig::for_data_dir(data_dir)).map_err(|err| err.to_string())?;
    let visible = |controller: &SyncController| {
        controller.fireball_count().map_err(|err| err.to_string())
    };

    let before = visible(&controller)?;
    let report = controller
        .fetch_and_ingest_now()
        .map_err(|err| err.to_string())?;
    println!("fireball_cli inserted={}", report.inserted);

    // Imports reach the view through replay on a worker thread.
    let deadline = Instant::now() + REPLAY_WAIT;
    let mut after = visible(&controller)?;
    while after < before + report.inserted && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
        after = visible(&controller)?;
    }
    println!("fireball_cli visible_before={before} visible_after={after}");
    println!(
        "fireball_cli groups={}",
        controller.groups().map_err(|err| err.to_string())?.len()
    );
    controller.shutdown();
    Ok(())
}
