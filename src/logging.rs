use crate::configuration::{LogConfig, LogFormat, LogOutput};
use parking_lot::Mutex;
use slog::{o, Drain, Logger};
use slog_json::Json;
use slog_logfmt::Logfmt;
use std::io;

static ACTIVE_CONFIG: Mutex<Option<LogConfig>> = parking_lot::const_mutex(None);

/// Builds the root logger for the process that owns the whole process
/// tree, and remembers the configuration for forked children.
pub fn setup_logger(config: &LogConfig) -> Logger {
    *ACTIVE_CONFIG.lock() = Some(config.clone());
    build(config, true)
}

/// Replaces the global logger in a freshly forked child with a
/// synchronous one. Does nothing if [`setup_logger`] was never called.
pub fn after_fork(worker: &str) {
    let config = match ACTIVE_CONFIG.try_lock() {
        Some(guard) => guard.clone(),
        None => None,
    };
    if let Some(config) = config {
        let log = build(&config, false).new(o!(
            "worker" => worker.to_string(),
            "pid" => std::process::id(),
        ));
        slog_scope::set_global_logger(log).cancel_reset();
    }
}

fn build(config: &LogConfig, asynchronous: bool) -> Logger {
    let output: Box<dyn io::Write + Send + Sync> = match config.output {
        LogOutput::Stderr => Box::new(io::stderr()),
        LogOutput::Stdout => Box::new(io::stdout()),
    };
    match config.format {
        LogFormat::Json => {
            let drain = Json::new(output)
                .add_default_keys()
                .build()
                .filter_level(config.level.into())
                .fuse();
            root(drain, asynchronous)
        }
        LogFormat::Logfmt { print_prefix } => {
            let mut builder = Logfmt::new(output);
            if !print_prefix {
                builder = builder.no_prefix().print_msg(true);
            }
            let drain = builder.build().filter_level(config.level.into()).fuse();
            root(drain, asynchronous)
        }
    }
}

fn root<D>(drain: D, asynchronous: bool) -> Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    if asynchronous {
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!("logger" => "zellkern"))
    } else {
        let drain = std::sync::Mutex::new(drain).fuse();
        Logger::root(drain, o!("logger" => "zellkern"))
    }
}
