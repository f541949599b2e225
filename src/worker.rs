use crate::error::{ChannelError, ErrorReport, WorkerError};
use crate::message_channel::MessageChannel;
use crate::process;
use crate::signals::{self, SignalScope, HARD_TERMINATION_SIGNAL};
use anyhow::anyhow;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use slog_scope::{debug, error, info, warn};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// Parses a received message into a request a [`Service`] can handle.
pub trait FromMessage: Sized {
    /// Fails with [`WorkerError::UnknownMessage`] if the message name
    /// isn't one this request type knows about.
    fn from_message(message: Vec<String>) -> Result<Self, WorkerError>;
}

/// What the dispatch loop should do after handling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// The code that runs inside a worker process.
pub trait Service {
    type Request: FromMessage;

    /// Used for logging and as the process name.
    fn name(&self) -> String;

    /// Runs in the parent, right before forking.
    fn before_fork(&mut self) {}

    /// Runs in the child before the dispatch loop starts. An error
    /// here skips the loop, but [`Service::finalize`] still runs.
    fn initialize(&mut self, _ctx: &mut WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle(&mut self, request: Self::Request, ctx: &mut WorkerContext)
        -> anyhow::Result<Flow>;

    /// Runs in the child once the dispatch loop is done, however it ended.
    fn finalize(&mut self, _ctx: &mut WorkerContext) {}

    /// Signals that end the dispatch loop.
    fn termination_signals(&self) -> Vec<Signal> {
        vec![HARD_TERMINATION_SIGNAL, Signal::SIGINT]
    }

    /// Signals that are handled like a request instead of ending the
    /// loop, along with the request each one stands for.
    fn signal_handlers(&self) -> Vec<(Signal, fn() -> Self::Request)> {
        vec![]
    }
}

/// What a service has access to while it runs inside its worker process.
#[derive(Debug)]
pub struct WorkerContext {
    name: String,
    channel: MessageChannel,
}

impl WorkerContext {
    fn new(name: String, channel: MessageChannel) -> Self {
        WorkerContext { name, channel }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker's end of the channel to its supervisor.
    pub fn channel(&mut self) -> &mut MessageChannel {
        &mut self.channel
    }
}

fn dispatch<S: Service>(
    service: &mut S,
    ctx: &mut WorkerContext,
    scope: &SignalScope,
    stop_on: &[Signal],
    handlers: &[(Signal, fn() -> S::Request)],
) -> anyhow::Result<()> {
    loop {
        if stop_on.iter().any(|sig| signals::take_pending(*sig)) {
            debug!("received termination signal");
            return Ok(());
        }
        for (signal, request) in handlers {
            if signals::take_pending(*signal) {
                debug!("handling signal"; "signal" => ?signal);
                if service.handle(request(), ctx)? == Flow::Quit {
                    return Ok(());
                }
            }
        }
        let mut fds = [
            PollFd::new(ctx.channel.as_raw_fd(), PollFlags::POLLIN),
            PollFd::new(scope.wakeup_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, -1) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }
        if fds[1].revents().map_or(false, |r| !r.is_empty()) {
            scope.drain_wakeups();
            continue;
        }
        let message = match ctx.channel.read_message()? {
            Some(message) => message,
            None => {
                debug!("supervisor closed the channel");
                return Ok(());
            }
        };
        let request = S::Request::from_message(message)?;
        if service.handle(request, ctx)? == Flow::Quit {
            return Ok(());
        }
    }
}

/// Runs `service` on `channel` in the current process until the
/// channel closes, a termination signal arrives or the service quits.
/// Signals with a handler are turned into requests in between messages.
pub fn run_synchronously<S: Service>(service: &mut S, channel: MessageChannel) -> anyhow::Result<()> {
    let stop_on = service.termination_signals();
    let handlers = service.signal_handlers();
    let mut armed = stop_on.clone();
    armed.extend(handlers.iter().map(|(signal, _)| *signal));
    let scope = SignalScope::arm(&armed)?;
    let mut ctx = WorkerContext::new(service.name(), channel);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        service.initialize(&mut ctx)?;
        dispatch(service, &mut ctx, &scope, &stop_on, &handlers)
    }));
    service.finalize(&mut ctx);
    drop(scope);
    match outcome {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("{}", ErrorReport::from_panic(panic.as_ref()))),
    }
}

fn run_child<S: Service>(service: &mut S, channel: MessageChannel) -> i32 {
    process::set_process_name(&service.name());
    process::prepare_child(&[channel.as_raw_fd()]);
    let saved = signals::reset_dispositions();
    let code = match run_synchronously(service, channel) {
        Ok(()) => 0,
        Err(e) => {
            error!("worker failed"; "error" => %e);
            1
        }
    };
    saved.revert();
    code
}

#[derive(Debug)]
enum Lifecycle {
    Unstarted,
    Running { pid: Pid, channel: MessageChannel },
    Stopped,
}

/// The parent's handle on a worker process running a [`Service`].
#[derive(Debug)]
pub struct SupervisedWorker<S: Service> {
    service: S,
    lifecycle: Lifecycle,
    stop_timeout: Duration,
}

impl<S: Service> SupervisedWorker<S> {
    pub fn new(service: S) -> Self {
        SupervisedWorker {
            service,
            lifecycle: Lifecycle::Unstarted,
            stop_timeout: Duration::from_secs(3),
        }
    }

    /// How long [`stop`](Self::stop) waits before killing the worker.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Changes to the service reach the worker process on the next start.
    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    pub fn pid(&self) -> Option<Pid> {
        match &self.lifecycle {
            Lifecycle::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    /// Forks the worker process and starts its dispatch loop.
    pub fn start(&mut self) -> Result<Pid, WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyStarted);
        }
        let (ours, theirs) = MessageChannel::pair().map_err(ChannelError::from)?;
        self.service.before_fork();
        let name = self.service.name();
        let service = &mut self.service;
        // `theirs` moves into the child's body; the parent's copy is
        // closed when fork_process drops the body.
        let pid = process::fork_process(&name, move || run_child(service, theirs))?;
        info!("started worker"; "worker" => &name, "pid" => pid.as_raw());
        self.lifecycle = Lifecycle::Running { pid, channel: ours };
        Ok(pid)
    }

    /// Closes the channel, terminates the worker and waits until it is reaped.
    pub fn stop(&mut self) -> Result<(), WorkerError> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { pid, channel } => {
                channel.close();
                let status = process::terminate(pid, self.stop_timeout)?;
                debug!("worker stopped"; "worker" => self.service.name(), "pid" => pid.as_raw(), "status" => ?status);
                Ok(())
            }
            previous => {
                self.lifecycle = previous;
                Err(WorkerError::NotStarted)
            }
        }
    }

    pub fn channel(&mut self) -> Result<&mut MessageChannel, WorkerError> {
        match &mut self.lifecycle {
            Lifecycle::Running { channel, .. } => Ok(channel),
            _ => Err(WorkerError::NotStarted),
        }
    }

    pub fn send<T: AsRef<str>>(&mut self, parts: &[T]) -> Result<(), WorkerError> {
        Ok(self.channel()?.write_message(parts)?)
    }

    /// Reads the next message; the worker closing the channel is an error here.
    pub fn receive(&mut self) -> Result<Vec<String>, WorkerError> {
        self.channel()?
            .read_message()?
            .ok_or(WorkerError::Channel(ChannelError::Eof))
    }

    pub fn receive_scalar(&mut self) -> Result<Vec<u8>, WorkerError> {
        self.channel()?
            .read_scalar()?
            .ok_or(WorkerError::Channel(ChannelError::Eof))
    }

    pub fn receive_fd(&mut self) -> Result<OwnedFd, WorkerError> {
        Ok(self.channel()?.recv_fd()?)
    }
}

impl<S: Service> Drop for SupervisedWorker<S> {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("could not stop worker"; "worker" => self.service.name(), "error" => %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[derive(Debug)]
    enum Echo {
        Say(String),
        Quit,
    }

    impl FromMessage for Echo {
        fn from_message(mut message: Vec<String>) -> Result<Self, WorkerError> {
            match message[0].as_str() {
                "say" if message.len() == 2 => Ok(Echo::Say(message.remove(1))),
                "quit" => Ok(Echo::Quit),
                _ => Err(WorkerError::UnknownMessage(message.remove(0))),
            }
        }
    }

    #[derive(Default)]
    struct EchoService {
        finalized: bool,
    }

    impl Service for EchoService {
        type Request = Echo;

        fn name(&self) -> String {
            "echo".to_string()
        }

        fn handle(&mut self, request: Echo, ctx: &mut WorkerContext) -> anyhow::Result<Flow> {
            match request {
                Echo::Say(what) => {
                    ctx.channel().write_message(&["said", what.as_str()])?;
                    Ok(Flow::Continue)
                }
                Echo::Quit => Ok(Flow::Quit),
            }
        }

        fn finalize(&mut self, _ctx: &mut WorkerContext) {
            self.finalized = true;
        }
    }

    #[test]
    fn lifecycle_errors_without_a_process() {
        let mut worker = SupervisedWorker::new(EchoService::default());
        assert_matches!(worker.stop(), Err(WorkerError::NotStarted));
        assert_matches!(worker.send(&["say", "hi"]), Err(WorkerError::NotStarted));
        assert_matches!(worker.receive(), Err(WorkerError::NotStarted));
        assert_eq!(worker.pid(), None);
    }

    #[test]
    fn serves_in_process_until_quit() {
        let (mut client, server) = MessageChannel::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let mut service = EchoService::default();
            let mut ctx = WorkerContext::new(service.name(), server);
            loop {
                let message = ctx.channel().read_message().unwrap().unwrap();
                let request = Echo::from_message(message).unwrap();
                if service.handle(request, &mut ctx).unwrap() == Flow::Quit {
                    break;
                }
            }
        });
        client.write_message(&["say", "hello"]).unwrap();
        assert_eq!(
            client.read_message().unwrap().unwrap(),
            vec!["said".to_string(), "hello".to_string()]
        );
        client.write_message(&["quit"]).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn unknown_messages_are_rejected() {
        assert_matches!(
            Echo::from_message(vec!["dance".to_string()]),
            Err(WorkerError::UnknownMessage(ref name)) if name == "dance"
        );
    }
}
