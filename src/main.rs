use anyhow::{Context, Result};
use slog_scope::info;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use zellkern::application::StaticSiteLoader;
use zellkern::configuration;
use zellkern::dispatcher::SpawnServer;
use zellkern::logging;
use zellkern::message_channel::MessageChannel;
use zellkern::spawner::Hosting;
use zellkern::worker;

/// A preloading application spawner that serves spawn requests over a
/// unix socket it inherits from its parent.
#[derive(StructOpt, Debug)]
#[structopt(name = "zellkern")]
struct Opt {
    /// Path to the configuration file to use. Default: ./zellkern.toml, if it exists
    #[structopt(short = "f", long)]
    config_file: Option<PathBuf>,

    /// File descriptor of the unix socket to read spawn requests from.
    #[structopt(long, default_value = "0")]
    channel_fd: i32,
}

fn load_config(opt: &Opt) -> Result<configuration::Config> {
    let mut settings = config::Config::default();
    let config_file = match &opt.config_file {
        Some(path) => Some(path.canonicalize()?),
        None => PathBuf::from("./zellkern.toml").canonicalize().ok(),
    };
    if let Some(path) = &config_file {
        settings.merge(config::File::from(path.as_path()))?;
    }
    settings.merge(config::Environment::with_prefix("ZELLKERN").separator("__"))?;
    settings
        .try_into::<configuration::Config>()
        .context(format!("Could not parse configuration file {:?}", &config_file))
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let settings = load_config(&opt)?;
    let log = logging::setup_logger(&settings.log);
    let _guard = slog_scope::set_global_logger(log);

    info!("startup"; "channel_fd" => opt.channel_fd, "spawn_method" => ?settings.spawner.spawn_method);
    // The fd is ours: it was handed to us by the process that started us.
    let stream = unsafe { UnixStream::from_raw_fd(opt.channel_fd) };
    let mut server = SpawnServer::new(Hosting::new(Arc::new(StaticSiteLoader), settings));
    worker::run_synchronously(&mut server, MessageChannel::new(stream))?;
    info!("shutdown");
    Ok(())
}
