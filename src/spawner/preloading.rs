use super::handshake::await_init_status;
use super::protocol::{self, transport_error};
use super::{become_worker, bootstrap, describe_app, load_application};
use super::{AppProcess, Hosting, SpawnOptions, Spawner};
use crate::application::Application;
use crate::error::{InitStage, SpawnError, WorkerError};
use crate::message_channel::MessageChannel;
use crate::process;
use crate::worker::{Flow, FromMessage, Service, SupervisedWorker, WorkerContext};
use anyhow::{anyhow, bail};
use nix::unistd::Pid;
use slog_scope::{debug, info};
use std::time::Duration;

const SPAWN: &str = "spawn";

/// The only thing a preloader gets asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawn;

impl FromMessage for Spawn {
    fn from_message(message: Vec<String>) -> Result<Self, WorkerError> {
        match message.first().map(String::as_str) {
            Some(SPAWN) => Ok(Spawn),
            other => Err(WorkerError::UnknownMessage(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

/// Runs inside the preloader process: loads the application once,
/// then forks a worker off the loaded image for every spawn request.
struct AppPreloader {
    hosting: Hosting,
    options: SpawnOptions,
    app: Option<Box<dyn Application>>,
}

impl Service for AppPreloader {
    type Request = Spawn;

    fn name(&self) -> String {
        format!("zk-app: {}", self.options.app_root.display())
    }

    fn initialize(&mut self, ctx: &mut WorkerContext) -> anyhow::Result<()> {
        let hosting = &self.hosting;
        let options = &self.options;
        match bootstrap(|| load_application(hosting, options)) {
            Ok(app) => {
                protocol::report_success(ctx.channel())?;
                self.app = Some(app);
                Ok(())
            }
            Err(failure) => {
                protocol::report_failure(ctx.channel(), &failure)?;
                bail!("{} failed to load", describe_app(&options.app_root))
            }
        }
    }

    fn handle(&mut self, _: Spawn, ctx: &mut WorkerContext) -> anyhow::Result<Flow> {
        let app = self
            .app
            .as_mut()
            .ok_or_else(|| anyhow!("application is not loaded"))?;
        let (mut ours, theirs) = MessageChannel::pair()?;
        let app_root = &self.options.app_root;
        let config = &self.hosting.config;
        process::double_fork("zk-worker", move || {
            become_worker(app.as_mut(), theirs, app_root, config)
        })?;

        let what = describe_app(app_root);
        let reply = protocol::receive_spawn_reply(&mut ours, app_root, &what);
        if let Ok(worker) = &reply {
            debug!("spawned worker"; "pid" => worker.pid.as_raw());
        }
        protocol::send_spawn_reply(ctx.channel(), reply.as_ref())?;
        Ok(Flow::Continue)
    }
}

/// A handle on a preloader process for one application.
pub struct ApplicationSpawner {
    worker: SupervisedWorker<AppPreloader>,
    options: SpawnOptions,
    max_idle_time: Option<Duration>,
}

impl ApplicationSpawner {
    /// Starts the preloader and waits until it has loaded the application.
    pub fn start(hosting: &Hosting, options: &SpawnOptions) -> Result<ApplicationSpawner, SpawnError> {
        let what = describe_app(&options.app_root);
        let mut worker = SupervisedWorker::new(AppPreloader {
            hosting: hosting.clone(),
            options: options.clone(),
            app: None,
        })
        .with_stop_timeout(hosting.config.spawner.stop_timeout);
        worker
            .start()
            .map_err(|e| SpawnError::unavailable(what.clone(), e))?;
        let status = match worker.channel() {
            Ok(channel) => await_init_status(channel, InitStage::Application, &what),
            Err(e) => Err(SpawnError::unavailable(what.clone(), e)),
        };
        if let Err(e) = status {
            let _ = worker.stop();
            return Err(e);
        }
        info!("application preloaded"; "app_root" => ?options.app_root, "pid" => worker.pid().map(Pid::as_raw));
        Ok(ApplicationSpawner {
            worker,
            options: options.clone(),
            max_idle_time: options.app_spawner_timeout,
        })
    }

    /// Overrides how long this spawner may stay idle in a cache.
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = Some(max_idle_time);
        self
    }

    /// The preloader's pid.
    pub fn pid(&self) -> Option<Pid> {
        self.worker.pid()
    }

    /// Forks a new worker off the preloaded application.
    pub fn spawn(&mut self) -> Result<AppProcess, SpawnError> {
        let what = describe_app(&self.options.app_root);
        let channel = self
            .worker
            .channel()
            .map_err(|e| SpawnError::unavailable(what.clone(), e))?;
        channel
            .write_message(&[SPAWN])
            .map_err(|e| transport_error(&what, e))?;
        protocol::receive_spawn_reply(channel, &self.options.app_root, &what)
    }
}

impl Spawner for ApplicationSpawner {
    fn spawn_application(&mut self, _options: &SpawnOptions) -> Result<AppProcess, SpawnError> {
        self.spawn()
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.worker.stop() {
            debug!("preloader already stopped"; "app_root" => ?self.options.app_root, "error" => %e);
        }
    }

    fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }
}
