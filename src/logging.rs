use slog::Drain;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

pub fn parse_level(level: &str) -> Option<slog::Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(slog::Level::Trace),
        "debug" => Some(slog::Level::Debug),
        "info" => Some(slog::Level::Info),
        "warn" | "warning" => Some(slog::Level::Warning),
        "error" => Some(slog::Level::Error),
        "critical" => Some(slog::Level::Critical),
        _ => None,
    }
}

pub fn create_root_logger_for_stdout(server_id: String, level: slog::Level) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("server_id" => server_id))
}

/// Appends to `log_path`, creating it if needed.
pub fn create_root_logger_for_file(
    log_path: &Path,
    server_id: String,
    level: slog::Level,
) -> io::Result<slog::Logger> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Ok(slog::Logger::root(drain, slog::o!("server_id" => server_id)))
}
