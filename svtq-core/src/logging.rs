//! Structured logging setup (§1.1 "Logging").
//!
//! A `tracing_subscriber::Registry` with two `fmt` layers: a non-blocking rolling-file layer
//! for full detail and a compact stderr layer gated by the CLI's verbosity flag. Per-module
//! level overrides are read from `RUST_LOG`, following the teacher's module-config-map pattern
//! (not its legacy single-file logger, which this expansion deliberately does not carry).

use std::collections::HashMap;
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static WORKER_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

pub const DEFAULT_CONSOLE_LEVEL: LevelFilter = LevelFilter::INFO;
pub const DEFAULT_FILE_LEVEL: LevelFilter = LevelFilter::DEBUG;

#[derive(Debug, Clone)]
struct ModuleConfig {
    console_level: LevelFilter,
    file_level: LevelFilter,
}

/// Every pipeline-carrying module gets its own entry so `RUST_LOG=svtq_core::pipeline_tq=trace`
/// can single one out without raising the global level.
const TRACKED_MODULES: &[&str] = &[
    "svtq_core",
    "svtq_core::planner",
    "svtq_core::dispatcher",
    "svtq_core::pipeline_std",
    "svtq_core::pipeline_tq",
    "svtq_core::tq_state",
    "svtq_core::scene_detect",
    "svtq_core::merge",
    "svtq_cli",
];

/// Initializes the global `tracing` subscriber. Idempotent in practice because it's only ever
/// called once, from the CLI entrypoint; a second call would panic via
/// `set_global_default`, which is the desired fail-fast behavior for a programming error.
pub fn init_logging(console_level: LevelFilter, log_path: PathBuf, file_level: LevelFilter) {
    let mut module_configs: HashMap<&str, ModuleConfig> = TRACKED_MODULES
        .iter()
        .map(|&m| {
            (
                m,
                ModuleConfig {
                    console_level,
                    file_level,
                },
            )
        })
        .collect();

    if let Ok(rust_log) = env::var("RUST_LOG") {
        for directive in rust_log.split(',') {
            let Some((module, level)) = directive.split_once('=') else {
                continue;
            };
            if let (Some(config), Ok(level)) = (module_configs.get_mut(module), level.parse::<LevelFilter>()) {
                config.console_level = level;
                config.file_level = level;
            }
        }
    }

    let build_filter = |pick: fn(&ModuleConfig) -> LevelFilter| -> EnvFilter {
        let directives: Vec<String> = module_configs
            .iter()
            .map(|(module, config)| format!("{module}={}", pick(config)))
            .collect();
        EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let console_filter = build_filter(|c| c.console_level);
    let file_filter = build_filter(|c| c.file_level);

    let dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("svtq.log"));
    let file_appender = RollingFileAppender::new(Rotation::NEVER, dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = WORKER_GUARD.set(guard);

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(non_blocking)
                .with_filter(file_filter),
        )
        .with(
            fmt::layer()
                .compact()
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false)
                .with_file(false)
                .without_time()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        );

    tracing::subscriber::set_global_default(subscriber).expect("logging subscriber already set");
    tracing::debug!("logging initialized");
}
