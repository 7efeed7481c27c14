//! Process-wide `tracing` setup for the `parley` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Full filter directive; overrides `--log-level` entirely.
const FILTER_ENV: &str = "PARLEY_LOG_FILTER";
/// Keep webrtc stack output at trace instead of capping it at info.
const TRACE_DEPS_ENV: &str = "PARLEY_TRACE_DEPS";

// webrtc logs per packet at trace.
const NOISY_AT_TRACE: &str = "webrtc=info,webrtc_ice=info,webrtc_dtls=info,webrtc_srtp=info,interceptor=info";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot install log subscriber: {0}")]
    Install(String),
}

// Also marks the subscriber as installed.
static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Only the first call has any effect.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let directives = match std::env::var(FILTER_ENV) {
        Ok(custom) => custom,
        Err(_) => directives_for(config.level, flag_set(TRACE_DEPS_ENV)),
    };
    let capped = directives.contains(NOISY_AT_TRACE);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;
    let _ = WRITER_GUARD.set(guard);

    if capped {
        tracing::info!(
            target = "parley::telemetry",
            "webrtc stack capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to see it"
        );
    }
    Ok(())
}

fn flag_set(var: &str) -> bool {
    std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
}

/// Our own crates follow `level`; everything else stays at info or quieter.
fn directives_for(level: LogLevel, dependency_traces: bool) -> String {
    let ours = match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => return "info".to_owned(),
        LogLevel::Warn => return "warn".to_owned(),
        LogLevel::Error => return "error".to_owned(),
    };
    let mut directives = format!("info,parley={ours},parley_core={ours},signal_bus={ours}");
    if level == LogLevel::Trace && !dependency_traces {
        directives.push(',');
        directives.push_str(NOISY_AT_TRACE);
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_caps_the_webrtc_stack() {
        let capped = directives_for(LogLevel::Trace, false);
        assert!(capped.starts_with("info,parley=trace,parley_core=trace"));
        assert!(capped.ends_with(NOISY_AT_TRACE));

        let uncapped = directives_for(LogLevel::Trace, true);
        assert!(!uncapped.contains("webrtc"));
    }

    #[test]
    fn quieter_levels_apply_to_everything() {
        assert_eq!(directives_for(LogLevel::Warn, false), "warn");
        assert_eq!(directives_for(LogLevel::Error, true), "error");
        assert_eq!(directives_for(LogLevel::Info, false), "info");
        assert_eq!(
            directives_for(LogLevel::Debug, false),
            "info,parley=debug,parley_core=debug,signal_bus=debug"
        );
    }
}
