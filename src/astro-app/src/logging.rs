// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a configured level name, falling back to INFO.
pub fn parse_level(log_level: Option<&str>) -> Level {
    log_level
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO)
}

/// Initialize logging with optional level from config.
///
/// Module targets are shown from DEBUG down, where several crates log
/// per-tick detail. A second call is a no-op.
pub fn init_logging(log_level: Option<&str>) {
    let level = parse_level(log_level);

    let _ = FmtSubscriber::builder()
        .with_target(level >= Level::DEBUG)
        .with_max_level(level)
        .try_init();
}
