// src/utils/log.rs

//! Logger setup and console report helpers.
//!
//! Library code logs through the `log` macros. The CLI calls [`init`] to
//! install `env_logger` with server-style `[timestamp] [LEVEL] message` lines,
//! and uses the report helpers below for operator-facing summaries.

/// Log level names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name, falling back to `Info`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Install the process logger. `RUST_LOG` overrides the configured level.
#[cfg(feature = "cli")]
pub fn init(level: &str) {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LogLevel::parse(level).to_filter())
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        });
    // A second init (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
}

/// Print a header block
pub fn header(title: &str) {
    let border = "═".repeat(60);
    println!("{border}");
    println!("  {title}");
    println!("{border}");
}

/// Print a separator line
pub fn separator() {
    println!("{}", "─".repeat(60));
}

/// Print an indented sub-item
pub fn sub_item(message: &str) {
    println!("    {message}");
}

/// Print a titled key/value summary
pub fn summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("[SUMMARY] {title}");
    for (key, value) in items {
        println!("    {key}: {value}");
    }
}
