//! Tracing subscriber bootstrap.
//!
//! The library emits `tracing` events at session boundaries; embedding
//! applications may install their own subscriber instead of calling
//! [`init_logging`].

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static INSTALLED_LEVEL: OnceLock<String> = OnceLock::new();

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Install a stderr fmt subscriber filtered at `level` (or by `RUST_LOG` when set).
///
/// Calling again with the same level is a no-op; a different level is
/// rejected. Never panics.
pub fn init_logging(level: &str) -> Result<(), String> {
    let level = level.trim().to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(format!("unsupported log level `{}`", level));
    }

    if let Some(installed) = INSTALLED_LEVEL.get() {
        if *installed == level {
            return Ok(());
        }
        return Err(format!(
            "logging already initialized with level `{}`; refusing to switch to `{}`",
            installed, level
        ));
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nbcall={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| format!("failed to install subscriber: {}", e))?;

    let _ = INSTALLED_LEVEL.set(level);
    Ok(())
}

/// [`init_logging`] at the `NBCALL_LOG` level from `config`.
pub fn init_from_config(config: &Config) -> Result<(), String> {
    init_logging(&config.log_level())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level() {
        assert!(init_logging("chatty").is_err());
    }

    #[test]
    fn configured_level_is_validated() {
        let config = Config::from_pairs([("NBCALL_LOG", "chatty")]);
        let err = init_from_config(&config).unwrap_err();
        assert!(err.contains("chatty"), "{err}");
    }
}
