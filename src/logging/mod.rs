use crate::config::settings::LoggingConfig;
use crate::models::ProxyLog;
use anyhow::Result;
use log::{debug, error, info, trace, warn, LevelFilter};
use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize console logging driven by `RUST_LOG` (default `info`)
pub fn init_logger() {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = init_logger_with_config(&level, &LoggingConfig::default());
}

/// Initialize console logging plus the optional rolling log file
///
/// The returned guard flushes the file writer when dropped, so the caller
/// must keep it alive for as long as it wants file output.
pub fn init_logger_with_config(level: &str, config: &LoggingConfig) -> Option<WorkerGuard> {
    let mut guard = None;

    INIT.call_once(|| {
        let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

        let console = fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true);

        let file = if config.enable_file_logging {
            let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
        } else {
            None
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file);

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Warning: Failed to install tracing subscriber: {:?}", e);
        }

        // Bridge `log` records into tracing (after subscriber is set up)
        if let Err(e) = LogTracer::init() {
            eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
        }

        log::set_max_level(level_filter(level));
    });

    guard
}

fn level_filter(level: &str) -> LevelFilter {
    // Directives like "rust_pooling_proxy=debug,info" carry their level last.
    let last = level.rsplit(['=', ',']).next().unwrap_or(level);
    last.trim().parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
}

/// Log a proxy transaction as JSON at debug level
pub fn log_transaction(log_entry: &ProxyLog) -> Result<()> {
    let log_message = serde_json::to_string(log_entry)?;
    debug!("TRANSACTION: {}", log_message);
    Ok(())
}

/// Log an error message
pub fn log_error(message: &str) {
    error!("{}", message);
}

/// Log an info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log a warning message
pub fn log_warning(message: &str) {
    warn!("{}", message);
}

/// Log a debug message
pub fn log_debug(message: &str) {
    debug!("{}", message);
}

/// Log a trace message
pub fn log_trace(message: &str) {
    trace!("{}", message);
}

/// Convenience macro for logging proxy transactions
#[macro_export]
macro_rules! log_proxy_transaction {
    ($log_entry:expr) => {
        if let Err(e) = $crate::logging::log_transaction($log_entry) {
            eprintln!("Failed to log transaction: {}", e);
        }
    };
}

/// Convenience macro for logging errors
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

/// Convenience macro for logging info messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

/// Convenience macro for logging warning messages
#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

/// Convenience macro for logging debug messages
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}

/// Convenience macro for logging trace messages
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_trace(&format!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequestData, ResponseData};

    #[test]
    fn test_level_filter_from_directives() {
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("hyper=warn,trace"), LevelFilter::Trace);
        assert_eq!(level_filter("nonsense"), LevelFilter::Info);
    }

    #[test]
    fn test_transaction_serializes() {
        let request = RequestData {
            method: "GET".to_string(),
            path: "/foo".to_string(),
            http_version: "HTTP/1.1".to_string(),
            client_addr: "127.0.0.1:5000".parse().unwrap(),
            body_bytes: 0,
        };
        let response = ResponseData {
            status_code: 200,
            content_length: Some(10),
            body_bytes: 10,
            path_total_bytes: 10,
            upstream_connection: 1,
            reused_connection: false,
            response_time_ms: 3,
        };
        let entry = ProxyLog::completed(request, response);
        assert!(log_transaction(&entry).is_ok());

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["response"]["path_total_bytes"], 10);
        assert_eq!(json["request"]["path"], "/foo");
    }
}
