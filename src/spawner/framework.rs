use super::cache::{Reaper, SpawnerCache};
use super::handshake::await_init_status;
use super::protocol::{self, transport_error, SpawnRequest};
use super::{bootstrap, describe_app};
use super::{AppProcess, ApplicationSpawner, Hosting, SpawnOptions, Spawner};
use crate::error::{InitStage, SpawnError};
use crate::worker::{Flow, Service, SupervisedWorker, WorkerContext};
use anyhow::bail;
use nix::unistd::Pid;
use slog_scope::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn describe_framework(version: &str) -> String {
    format!("Framework {}", version)
}

/// Runs inside the framework spawner process: keeps one preloader per
/// application root, all forked off the preloaded framework.
struct FrameworkPreloader {
    hosting: Hosting,
    version: String,
    reaper_interval: Duration,
    app_max_idle_time: Duration,
    spawners: Option<Arc<SpawnerCache<PathBuf, ApplicationSpawner>>>,
    reaper: Option<Reaper>,
}

impl FrameworkPreloader {
    fn spawn_application(&self, options: &SpawnOptions) -> Result<AppProcess, SpawnError> {
        let spawners = match &self.spawners {
            Some(spawners) => spawners,
            None => return Err(SpawnError::Protocol("framework is not loaded".to_string())),
        };
        let options = options.clone().canonicalize()?;
        let key = options.app_root.clone();
        let result = spawners.lookup_or_insert_with(
            &key,
            Instant::now(),
            || ApplicationSpawner::start(&self.hosting, &options),
            |spawner| spawner.spawn(),
        );
        if let Err(e) = &result {
            if e.is_unavailable() {
                warn!("application spawner died, evicting it"; "app_root" => ?key, "error" => %e);
                spawners.evict(&key);
            }
        }
        result
    }

    fn reload(&self, app_root: Option<&Path>) {
        let spawners = match &self.spawners {
            Some(spawners) => spawners,
            None => return,
        };
        match app_root {
            Some(root) => {
                let key = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
                spawners.evict(&key);
            }
            None => spawners.clear(),
        }
    }
}

impl Service for FrameworkPreloader {
    type Request = SpawnRequest;

    fn name(&self) -> String {
        format!("zk-fw: {}", self.version)
    }

    fn initialize(&mut self, ctx: &mut WorkerContext) -> anyhow::Result<()> {
        let loader = &self.hosting.loader;
        let version = &self.version;
        if let Err(failure) = bootstrap(|| loader.preload_framework(version)) {
            protocol::report_failure(ctx.channel(), &failure)?;
            bail!("{} failed to load", describe_framework(version));
        }
        let spawners = Arc::new(SpawnerCache::new(self.app_max_idle_time));
        self.reaper = Some(Reaper::start(spawners.clone(), self.reaper_interval)?);
        self.spawners = Some(spawners);
        protocol::report_success(ctx.channel())?;
        Ok(())
    }

    fn handle(&mut self, request: SpawnRequest, ctx: &mut WorkerContext) -> anyhow::Result<Flow> {
        match request {
            SpawnRequest::SpawnApplication(options) => {
                let result = self.spawn_application(&options);
                protocol::send_spawn_reply(ctx.channel(), result.as_ref())?;
            }
            SpawnRequest::Reload(app_root) => self.reload(app_root.as_deref()),
        }
        Ok(Flow::Continue)
    }

    fn finalize(&mut self, _ctx: &mut WorkerContext) {
        if let Some(mut reaper) = self.reaper.take() {
            reaper.stop();
        }
        if let Some(spawners) = self.spawners.take() {
            spawners.clear();
        }
    }
}

/// A handle on a framework spawner process.
pub struct FrameworkSpawner {
    worker: SupervisedWorker<FrameworkPreloader>,
    version: String,
    max_idle_time: Option<Duration>,
}

impl FrameworkSpawner {
    /// Starts the framework spawner with the configured settings and
    /// waits until it has loaded the framework.
    pub fn start(hosting: &Hosting, version: &str) -> Result<FrameworkSpawner, SpawnError> {
        FrameworkSpawner::new(hosting, version).boot()
    }

    /// A framework spawner that isn't running yet; see [`boot`](Self::boot).
    pub fn new(hosting: &Hosting, version: &str) -> FrameworkSpawner {
        let config = &hosting.config.spawner;
        let worker = SupervisedWorker::new(FrameworkPreloader {
            hosting: hosting.clone(),
            version: version.to_string(),
            reaper_interval: config.reaper_interval,
            app_max_idle_time: config.max_idle_time,
            spawners: None,
            reaper: None,
        })
        .with_stop_timeout(config.stop_timeout);
        FrameworkSpawner {
            worker,
            version: version.to_string(),
            max_idle_time: None,
        }
    }

    /// How often idle application spawners get looked for.
    pub fn with_reaper_interval(mut self, reaper_interval: Duration) -> Self {
        self.worker.service_mut().reaper_interval = reaper_interval;
        self
    }

    /// How long application spawners may stay idle, unless a spawn
    /// request says otherwise. Zero keeps them forever.
    pub fn with_app_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.worker.service_mut().app_max_idle_time = max_idle_time;
        self
    }

    /// Overrides how long this spawner may stay idle in a cache.
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = Some(max_idle_time);
        self
    }

    /// Forks the framework spawner and waits until it has loaded the framework.
    pub fn boot(mut self) -> Result<FrameworkSpawner, SpawnError> {
        let what = describe_framework(&self.version);
        self.worker
            .start()
            .map_err(|e| SpawnError::unavailable(what.clone(), e))?;
        let status = match self.worker.channel() {
            Ok(channel) => await_init_status(channel, InitStage::Framework, &what),
            Err(e) => Err(SpawnError::unavailable(what.clone(), e)),
        };
        if let Err(e) = status {
            let _ = self.worker.stop();
            return Err(e);
        }
        info!("framework preloaded"; "version" => &self.version, "pid" => self.worker.pid().map(Pid::as_raw));
        Ok(self)
    }

    pub fn pid(&self) -> Option<Pid> {
        self.worker.pid()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn send(&mut self, request: &SpawnRequest) -> Result<(), SpawnError> {
        let what = describe_framework(&self.version);
        self.worker
            .channel()
            .map_err(|e| SpawnError::unavailable(what.clone(), e))?
            .write_message(request.to_message().as_slice())
            .map_err(|e| transport_error(&what, e))
    }

    /// Stops the preloaders of `app_root`, or of all applications, so
    /// the next spawn loads fresh code.
    pub fn reload(&mut self, app_root: Option<&Path>) -> Result<(), SpawnError> {
        self.send(&SpawnRequest::Reload(app_root.map(Path::to_path_buf)))
    }
}

impl Spawner for FrameworkSpawner {
    fn spawn_application(&mut self, options: &SpawnOptions) -> Result<AppProcess, SpawnError> {
        self.send(&SpawnRequest::SpawnApplication(options.clone()))?;
        let what = describe_framework(&self.version);
        let channel = self
            .worker
            .channel()
            .map_err(|e| SpawnError::unavailable(what.clone(), e))?;
        let process = protocol::receive_spawn_reply(channel, &options.app_root, &what)?;
        debug!("spawned via framework"; "version" => &self.version, "app" => describe_app(&options.app_root), "pid" => process.pid.as_raw());
        Ok(process)
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.worker.stop() {
            debug!("framework spawner already stopped"; "version" => &self.version, "error" => %e);
        }
    }

    fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }
}
