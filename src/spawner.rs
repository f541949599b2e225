use crate::application::{Application, LoadContext, Loader};
use crate::configuration::Config;
use crate::error::{ErrorReport, InitStage, InitializationError, SpawnError};
use crate::message_channel::MessageChannel;
use crate::process::{self, Identity};
use crate::request_handler::{self, RequestHandler};
use anyhow::Context;
use nix::unistd::Pid;
use slog_scope::{debug, error, warn};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
mod direct;
mod framework;
mod handshake;
mod preloading;
pub mod protocol;

pub use direct::DirectSpawner;
pub use framework::FrameworkSpawner;
pub use preloading::ApplicationSpawner;

/// Environment variable through which applications learn their
/// deployment environment.
pub const ENVIRONMENT_VAR: &str = "ZELLKERN_ENV";

/// Everything spawners need to host applications: the code that loads
/// them and the settings they run with.
#[derive(Clone)]
pub struct Hosting {
    pub loader: Arc<dyn Loader>,
    pub config: Arc<Config>,
}

impl Hosting {
    pub fn new(loader: Arc<dyn Loader>, config: Config) -> Self {
        Hosting {
            loader,
            config: Arc::new(config),
        }
    }
}

/// What to spawn, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub app_root: PathBuf,
    pub identity: Identity,
    /// The deployment environment. Default: production
    pub environment: String,
    /// Whether to switch to an unprivileged user when running as root.
    pub lower_privilege: bool,
    /// How long a framework spawner started for this request may stay
    /// idle. `None` uses the configured default, zero keeps it forever.
    pub framework_spawner_timeout: Option<Duration>,
    /// Same, for the application spawner started for this request.
    pub app_spawner_timeout: Option<Duration>,
}

impl SpawnOptions {
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        SpawnOptions {
            app_root: app_root.into(),
            identity: Identity::default(),
            environment: "production".to_string(),
            lower_privilege: true,
            framework_spawner_timeout: None,
            app_spawner_timeout: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_framework_spawner_timeout(mut self, timeout: Duration) -> Self {
        self.framework_spawner_timeout = Some(timeout);
        self
    }

    pub fn with_app_spawner_timeout(mut self, timeout: Duration) -> Self {
        self.app_spawner_timeout = Some(timeout);
        self
    }

    /// Resolves the application root to a canonical directory path, so
    /// that different spellings of the same root share spawners.
    pub fn canonicalize(mut self) -> Result<Self, SpawnError> {
        let invalid = |reason: String| SpawnError::InvalidAppRoot {
            path: self.app_root.clone(),
            reason,
        };
        let root = self
            .app_root
            .canonicalize()
            .map_err(|e| invalid(e.to_string()))?;
        if !root.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }
        self.app_root = root;
        Ok(self)
    }
}

/// A worker process serving an application, as handed to the caller
/// of a spawner.
#[derive(Debug)]
pub struct AppProcess {
    pub app_root: PathBuf,
    pub pid: Pid,
    pub socket_path: PathBuf,
    pub listener: OwnedFd,
    /// Reading from this returns EOF once the worker has exited.
    pub owner_pipe: OwnedFd,
}

/// Something that can spawn application workers.
pub trait Spawner {
    fn spawn_application(&mut self, options: &SpawnOptions) -> Result<AppProcess, SpawnError>;

    /// Stops the processes backing this spawner, if there are any.
    fn shutdown(&mut self);

    /// How long this spawner may sit unused in a cache before it gets
    /// stopped, if it differs from the cache's default.
    fn max_idle_time(&self) -> Option<Duration> {
        None
    }
}

/// Why bootstrapping a framework or an application failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BootFailure {
    Raised(ErrorReport),
    Exited,
}

impl BootFailure {
    fn from_error(e: anyhow::Error) -> Self {
        if e.downcast_ref::<crate::application::ApplicationExit>().is_some() {
            BootFailure::Exited
        } else {
            BootFailure::Raised(ErrorReport::from_error(&e))
        }
    }

    pub(crate) fn into_error(self, stage: InitStage, what: &str) -> InitializationError {
        match self {
            BootFailure::Raised(report) => InitializationError::raised(stage, what, report),
            BootFailure::Exited => InitializationError::exited(stage, what),
        }
    }
}

/// Runs bootstrap code, turning errors and panics into a [`BootFailure`].
pub(crate) fn bootstrap<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, BootFailure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BootFailure::from_error(e)),
        Err(panic) => Err(BootFailure::Raised(ErrorReport::from_panic(panic.as_ref()))),
    }
}

/// Sets up the current process to run the application in `options`:
/// identity, working directory and environment.
pub(crate) fn enter_application(options: &SpawnOptions, config: &Config) -> anyhow::Result<()> {
    if options.lower_privilege && config.privileges.lower_privilege {
        if let Err(e) = process::lower_privilege(
            &options.app_root,
            &options.identity,
            &config.privileges.lowest_user,
        ) {
            warn!("could not lower privileges"; "app_root" => ?options.app_root, "error" => %e);
        }
    }
    std::env::set_current_dir(&options.app_root)
        .with_context(|| format!("changing into {:?}", options.app_root))?;
    std::env::set_var(ENVIRONMENT_VAR, &options.environment);
    Ok(())
}

/// Loads the application in the current process.
pub(crate) fn load_application(
    hosting: &Hosting,
    options: &SpawnOptions,
) -> anyhow::Result<Box<dyn Application>> {
    enter_application(options, &hosting.config)?;
    hosting.loader.load_application(&LoadContext {
        app_root: options.app_root.clone(),
        environment: options.environment.clone(),
    })
}

/// Describes an application for messages, e.g. `Application '/srv/app'`.
pub(crate) fn describe_app(app_root: &Path) -> String {
    format!("Application '{}'", app_root.display())
}

/// The body of a freshly double-forked worker: prepares the
/// application for serving, hands the listening socket and the owner
/// pipe to the spawner through `report`, then serves requests.
pub(crate) fn become_worker(
    app: &mut dyn Application,
    mut report: MessageChannel,
    app_root: &Path,
    config: &Config,
) -> i32 {
    process::prepare_child(&[report.as_raw_fd()]);
    process::set_process_name("zk-worker");
    let pid = nix::unistd::getpid();

    let setup = bootstrap(|| {
        app.after_fork()?;
        let (listener, socket_path) =
            request_handler::bind_listener(&config.request_handler.socket_dir())
                .context("creating the listening socket")?;
        let (owner_read, owner_write) = request_handler::owner_pipe()?;
        Ok((listener, socket_path, owner_read, owner_write))
    });
    let (listener, socket_path, owner_read, owner_write) = match setup {
        Ok(setup) => setup,
        Err(failure) => {
            let err = SpawnError::from(
                failure.into_error(InitStage::Application, &describe_app(app_root)),
            );
            if let Err(e) = protocol::send_spawn_reply(&mut report, Err(&err)) {
                error!("could not report worker failure"; "error" => %e);
            }
            return 1;
        }
    };
    let handoff = AppProcess {
        app_root: app_root.to_path_buf(),
        pid,
        socket_path: socket_path.clone(),
        listener: match listener.try_clone() {
            Ok(listener) => listener.into(),
            Err(e) => {
                error!("could not duplicate listening socket"; "error" => %e);
                return 1;
            }
        },
        owner_pipe: owner_read,
    };
    if let Err(e) = protocol::send_spawn_reply(&mut report, Ok(&handoff)) {
        error!("could not hand off worker"; "error" => %e);
        return 1;
    }
    drop(handoff);
    report.close();

    let mut handler = RequestHandler::new(
        app,
        listener,
        socket_path,
        owner_write,
        &config.request_handler,
    );
    match handler.main_loop() {
        Ok(exit) => {
            debug!("worker done"; "exit" => ?exit);
            0
        }
        Err(e) => {
            error!("worker failed"; "error" => %e);
            1
        }
    }
}
