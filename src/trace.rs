//! Logging setup, mirroring how the reference CLI wires up its logger.
use simplelog::*;

/// Initialize a terminal logger at the given level. Library code never
/// calls this itself; it is for tests and any demo binary built on top
/// of this crate.
pub fn init_logging(level: LevelFilter) {
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let _ = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto);
}

/// Read the `MESHKV_LOG` environment variable (trace/debug/info/warn/error),
/// falling back to `Info`.
pub fn level_from_env() -> simplelog::LevelFilter {
    match std::env::var("MESHKV_LOG").as_deref() {
        Ok("trace") => LevelFilter::Trace,
        Ok("debug") => LevelFilter::Debug,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        Ok("off") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}
