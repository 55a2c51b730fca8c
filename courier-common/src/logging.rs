//! Log setup for courier processes.
//!
//! Verbosity is taken from `RUST_LOG` when set. Otherwise the courier
//! crates log at info (debug in debug builds) and everything else is held
//! at warn, so dependency noise never drowns out dispatch events.

use tracing_subscriber::EnvFilter;

/// Crates whose events make up courier's own log stream.
const CRATES: [&str; 4] = [
    "courier",
    "courier_common",
    "courier_manager",
    "courier_messenger",
];

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cfg!(debug_assertions) { "debug" } else { "info" };
        let directives: Vec<String> = CRATES
            .iter()
            .map(|krate| format!("{krate}={level}"))
            .collect();
        EnvFilter::new(format!("warn,{}", directives.join(",")))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
