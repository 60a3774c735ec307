use env_logger::{Builder, Env, TimestampPrecision};

/// Initializes `env_logger` for the binaries.
///
/// `verbosity` is the number of `-v` flags: 0 → warn, 1 → info, 2 → debug,
/// 3+ → trace. `RUST_LOG` overrides it. Calling twice is harmless.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(Some(TimestampPrecision::Micros))
        .try_init();
}
