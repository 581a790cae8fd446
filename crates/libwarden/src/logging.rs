//! Logging sink setup.
//!
//! The daemon logs through the `log` facade with a fern dispatcher behind
//! it, chained to stderr (foreground mode) and/or a log file. Fatal
//! messages always reach stderr, sink or no sink.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;

static STDERR_CHAINED: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
    pub stderr: bool,
}

/// Map the daemon's historical level names onto the `log` facade.
pub fn level_from_name(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "debug" => Some(LevelFilter::Debug),
        "info" | "note" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" | "critical" | "fatal" => Some(LevelFilter::Error),
        _ => None,
    }
}

pub fn setup(conf: &LogSettings) -> Result<(), String> {
    let mut logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ));
        })
        .level(conf.level);

    if conf.stderr {
        logger = logger.chain(std::io::stderr());
    }
    if let Some(path) = &conf.file {
        let file = fern::log_file(path)
            .map_err(|e| format!("could not open log file {}: {e}", path.display()))?;
        logger = logger.chain(file);
    }
    STDERR_CHAINED.store(conf.stderr, Ordering::SeqCst);

    logger
        .apply()
        .map_err(|e| format!("error while setting up logger: {e}"))
}

/// Log an unrecoverable condition. Copied to stderr unless stderr is
/// already a sink.
pub fn fatal(msg: &str) {
    log::error!("{msg}");
    if !STDERR_CHAINED.load(Ordering::SeqCst) {
        eprintln!("warden: {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_level_names_map_onto_the_facade() {
        assert_eq!(level_from_name("debug"), Some(LevelFilter::Debug));
        assert_eq!(level_from_name("NOTE"), Some(LevelFilter::Info));
        assert_eq!(level_from_name("critical"), Some(LevelFilter::Error));
        assert_eq!(level_from_name("fatal"), Some(LevelFilter::Error));
        assert_eq!(level_from_name("chatty"), None);
    }
}
