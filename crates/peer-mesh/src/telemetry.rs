use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

static COUNTERS: Lazy<Mutex<BTreeMap<&'static str, u64>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

pub const DROPPED_SENDS: &str = "relay.dropped_sends";
pub const UNDECODABLE_ENVELOPES: &str = "relay.undecodable";
pub const SUPPRESSED_DUPLICATES: &str = "peer.suppressed";
pub const NEGOTIATION_FAILURES: &str = "peer.failed";

/// Bump a process-wide counter.
pub fn increment(label: &'static str) {
    *COUNTERS.lock().entry(label).or_default() += 1;
}

pub fn value(label: &'static str) -> u64 {
    COUNTERS.lock().get(label).copied().unwrap_or(0)
}

/// Every counter touched so far, sorted by label.
pub fn counters() -> Vec<(&'static str, u64)> {
    COUNTERS
        .lock()
        .iter()
        .map(|(label, count)| (*label, *count))
        .collect()
}

/// Subscriber setup for binaries embedding the orchestrator.
///
/// Orchestrator events log under `mesh::relay`, `mesh::peer` and
/// `mesh::session`. `MESH_LOG_FILTER` replaces the computed filter outright.
pub mod logging {
    use std::path::{Path, PathBuf};

    use clap::ValueEnum;
    use once_cell::sync::OnceCell;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    use crate::error::{MeshError, MeshResult};

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of stderr.
        pub file: Option<PathBuf>,
    }

    // Holding the guard keeps the background writer flushing until exit.
    static WRITER: OnceCell<WorkerGuard> = OnceCell::new();

    /// Install the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> MeshResult<()> {
        WRITER.get_or_try_init(|| install(config)).map(|_| ())
    }

    fn install(config: &LogConfig) -> MeshResult<WorkerGuard> {
        let (writer, guard) = match &config.file {
            Some(path) => {
                let (dir, name) = split_log_path(path)?;
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let filter = match std::env::var("MESH_LOG_FILTER") {
            Ok(directives) => EnvFilter::new(directives),
            Err(_) => EnvFilter::new(mesh_directives(
                config.level.into(),
                env_flag("MESH_TRACE_DEPS"),
            )),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| MeshError::Setup(format!("logging: {err}")))?;
        Ok(guard)
    }

    fn split_log_path(path: &Path) -> MeshResult<(PathBuf, PathBuf)> {
        let name = path
            .file_name()
            .ok_or_else(|| MeshError::Setup(format!("log file {path:?} has no file name")))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((dir, PathBuf::from(name)))
    }

    fn env_flag(var: &str) -> bool {
        std::env::var(var).is_ok_and(|v| !v.is_empty() && v != "0")
    }

    /// WebRTC and WebSocket internals that drown out negotiation logs.
    const TRANSPORT_INTERNALS: &[&str] = &[
        "tungstenite",
        "tokio_tungstenite",
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "rustls",
    ];

    /// Orchestrator targets get `level`; everything else stays at info or
    /// quieter, and transport internals at warn unless `internals` is set.
    pub(crate) fn mesh_directives(level: LevelFilter, internals: bool) -> String {
        let mut directives = vec![level.min(LevelFilter::INFO).to_string().to_lowercase()];
        if level > LevelFilter::INFO {
            for target in ["mesh", "peer_mesh", "mesh_room"] {
                directives.push(format!("{target}={}", level.to_string().to_lowercase()));
            }
            if !internals {
                directives.extend(TRANSPORT_INTERNALS.iter().map(|target| format!("{target}=warn")));
            }
        }
        directives.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::logging::mesh_directives;
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn counters_accumulate() {
        let before = value("test.counter");
        increment("test.counter");
        increment("test.counter");
        assert_eq!(value("test.counter"), before + 2);
        assert!(counters().iter().any(|(label, _)| *label == "test.counter"));
    }

    #[test]
    fn debug_directives_quiet_transport_internals() {
        let directives = mesh_directives(LevelFilter::DEBUG, false);
        assert!(directives.starts_with("info,mesh=debug,peer_mesh=debug"));
        assert!(directives.contains("webrtc_ice=warn"));

        let verbose = mesh_directives(LevelFilter::TRACE, true);
        assert!(verbose.contains("mesh_room=trace"));
        assert!(!verbose.contains("=warn"));

        assert_eq!(mesh_directives(LevelFilter::WARN, false), "warn");
    }
}
