use super::handshake::await_init_status;
use super::protocol;
use super::{become_worker, bootstrap, describe_app, load_application};
use super::{AppProcess, Hosting, SpawnOptions, Spawner};
use crate::error::{ChannelError, InitStage, SpawnError};
use crate::message_channel::MessageChannel;
use crate::process;
use crate::signals;
use slog_scope::error;
use std::os::unix::io::AsRawFd;

/// Spawns workers without preloading anything: each worker loads the
/// application itself, right after it was forked.
pub struct DirectSpawner {
    hosting: Hosting,
}

impl DirectSpawner {
    pub fn new(hosting: Hosting) -> Self {
        DirectSpawner { hosting }
    }
}

fn direct_worker(hosting: &Hosting, options: &SpawnOptions, mut channel: MessageChannel) -> i32 {
    process::prepare_child(&[channel.as_raw_fd()]);
    let saved = signals::reset_dispositions();
    let loaded = bootstrap(|| load_application(hosting, options));
    let reported = match &loaded {
        Ok(_) => protocol::report_success(&mut channel),
        Err(failure) => protocol::report_failure(&mut channel, failure),
    };
    if let Err(e) = reported {
        error!("could not report initialization status"; "error" => %e);
        return 1;
    }
    let code = match loaded {
        Ok(mut app) => become_worker(app.as_mut(), channel, &options.app_root, &hosting.config),
        Err(_) => 1,
    };
    saved.revert();
    code
}

impl Spawner for DirectSpawner {
    fn spawn_application(&mut self, options: &SpawnOptions) -> Result<AppProcess, SpawnError> {
        let what = describe_app(&options.app_root);
        let (mut ours, theirs) = MessageChannel::pair()
            .map_err(|e| SpawnError::unavailable(&what, ChannelError::from(e)))?;
        let hosting = &self.hosting;
        process::double_fork("zk-direct", move || direct_worker(hosting, options, theirs))?;
        await_init_status(&mut ours, InitStage::Application, &what)?;
        protocol::receive_spawn_reply(&mut ours, &options.app_root, &what)
    }

    fn shutdown(&mut self) {}
}
