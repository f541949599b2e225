use crate::configuration::SpawnMethod;
use crate::error::SpawnError;
use crate::spawner::cache::SpawnerCache;
use crate::spawner::protocol::{self, SpawnRequest};
use crate::spawner::{
    AppProcess, ApplicationSpawner, DirectSpawner, FrameworkSpawner, Hosting, SpawnOptions,
    Spawner,
};
use crate::worker::{Flow, Service, WorkerContext};
use nix::sys::signal::Signal;
use slog_scope::{debug, info, warn};
use std::fmt::Debug;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct Dispatcher {
    hosting: Hosting,
    frameworks: SpawnerCache<String, FrameworkSpawner>,
    applications: SpawnerCache<PathBuf, ApplicationSpawner>,
}

/// Runs `action` on the cached spawner for `key`, evicting it if it turns
/// out to be gone, so that the next request starts a fresh one.
fn with_spawner<K, S>(
    cache: &SpawnerCache<K, S>,
    key: K,
    create: impl FnOnce() -> Result<S, SpawnError>,
    options: &SpawnOptions,
) -> Result<AppProcess, SpawnError>
where
    K: Eq + Hash + Clone + Debug,
    S: Spawner,
{
    let result = cache.lookup_or_insert_with(&key, Instant::now(), create, |spawner| {
        spawner.spawn_application(options)
    });
    if let Err(e) = &result {
        if e.is_unavailable() {
            warn!("spawner is gone, evicting it"; "key" => ?key, "error" => %e);
            cache.evict(&key);
        }
    }
    result
}

impl Dispatcher {
    pub fn new(hosting: Hosting) -> Self {
        let config = &hosting.config.spawner;
        Dispatcher {
            frameworks: SpawnerCache::new(config.framework_max_idle_time),
            applications: SpawnerCache::new(config.max_idle_time),
            hosting,
        }
    }

    pub fn spawn_method(&self) -> SpawnMethod {
        self.hosting.config.spawner.spawn_method
    }

    /// Spawns a worker for the application described by `options`.
    pub fn spawn_application(&self, options: &SpawnOptions) -> Result<AppProcess, SpawnError> {
        let options = options.clone().canonicalize()?;
        let now = Instant::now();
        self.frameworks.reap_idle(now);
        self.applications.reap_idle(now);

        let hosting = &self.hosting;
        match self.spawn_method() {
            SpawnMethod::Conservative => DirectSpawner::new(hosting.clone()).spawn_application(&options),
            SpawnMethod::Smart => match hosting.loader.detect_framework_version(&options.app_root) {
                Some(version) => {
                    debug!("using framework spawner"; "version" => &version);
                    let create = || -> Result<FrameworkSpawner, SpawnError> {
                        let spawner = FrameworkSpawner::start(hosting, &version)?;
                        Ok(match options.framework_spawner_timeout {
                            Some(timeout) => spawner.with_max_idle_time(timeout),
                            None => spawner,
                        })
                    };
                    with_spawner(&self.frameworks, version.clone(), create, &options)
                }
                None => self.spawn_preloaded(&options),
            },
            SpawnMethod::SmartLv2 => self.spawn_preloaded(&options),
        }
    }

    fn spawn_preloaded(&self, options: &SpawnOptions) -> Result<AppProcess, SpawnError> {
        with_spawner(
            &self.applications,
            options.app_root.clone(),
            || ApplicationSpawner::start(&self.hosting, options),
            options,
        )
    }

    /// Makes the next spawn for `app_root` (or for every application)
    /// load fresh application code.
    pub fn reload(&self, app_root: Option<&Path>) {
        info!("reloading"; "app_root" => ?app_root);
        match app_root {
            Some(root) => {
                let key = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
                self.applications.evict(&key);
            }
            None => self.applications.clear(),
        }
        for version in self.frameworks.keys() {
            let result = self
                .frameworks
                .with_existing(&version, |spawner| spawner.reload(app_root));
            if let Some(Err(e)) = result {
                warn!("could not reload framework spawner"; "version" => &version, "error" => %e);
                if e.is_unavailable() {
                    self.frameworks.evict(&version);
                }
            }
        }
    }

    /// Stops every spawner.
    pub fn shutdown(&self) {
        self.frameworks.clear();
        self.applications.clear();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reload_everything() -> SpawnRequest {
    SpawnRequest::Reload(None)
}

/// Serves spawn requests from a single client over a message channel,
/// using a [`Dispatcher`]. SIGHUP reloads every application.
pub struct SpawnServer {
    hosting: Hosting,
    dispatcher: Option<Dispatcher>,
}

impl SpawnServer {
    pub fn new(hosting: Hosting) -> Self {
        SpawnServer {
            hosting,
            dispatcher: None,
        }
    }
}

impl Service for SpawnServer {
    type Request = SpawnRequest;

    fn name(&self) -> String {
        "zk-spawn-server".to_string()
    }

    fn initialize(&mut self, _ctx: &mut WorkerContext) -> anyhow::Result<()> {
        info!("spawn server ready"; "spawn_method" => ?self.hosting.config.spawner.spawn_method);
        self.dispatcher = Some(Dispatcher::new(self.hosting.clone()));
        Ok(())
    }

    fn handle(&mut self, request: SpawnRequest, ctx: &mut WorkerContext) -> anyhow::Result<Flow> {
        let dispatcher = match &self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => anyhow::bail!("spawn server is not initialized"),
        };
        match request {
            SpawnRequest::SpawnApplication(options) => {
                let result = dispatcher.spawn_application(&options);
                match &result {
                    Ok(process) => {
                        info!("spawned"; "app_root" => ?options.app_root, "pid" => process.pid.as_raw())
                    }
                    Err(e) => warn!("spawning failed"; "app_root" => ?options.app_root, "error" => %e),
                }
                protocol::send_spawn_reply(ctx.channel(), result.as_ref())?;
            }
            SpawnRequest::Reload(app_root) => dispatcher.reload(app_root.as_deref()),
        }
        Ok(Flow::Continue)
    }

    fn signal_handlers(&self) -> Vec<(Signal, fn() -> SpawnRequest)> {
        vec![(Signal::SIGHUP, reload_everything as fn() -> SpawnRequest)]
    }

    fn finalize(&mut self, _ctx: &mut WorkerContext) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
    }
}
