use matches::assert_matches;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe, Pid};
use rusty_fork::*;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use zellkern::error::{ChannelError, WorkerError};
use zellkern::message_channel::MessageChannel;
use zellkern::process;
use zellkern::worker::{Flow, FromMessage, Service, SupervisedWorker, WorkerContext};

enum Command {
    Ping,
    Pid,
    Quit,
}

impl FromMessage for Command {
    fn from_message(message: Vec<String>) -> std::result::Result<Self, WorkerError> {
        match message[0].as_str() {
            "ping" => Ok(Command::Ping),
            "pid" => Ok(Command::Pid),
            "quit" => Ok(Command::Quit),
            other => Err(WorkerError::UnknownMessage(other.to_string())),
        }
    }
}

fn ping() -> Command {
    Command::Ping
}

struct Pinger;

impl Service for Pinger {
    type Request = Command;

    fn name(&self) -> String {
        "pinger".to_string()
    }

    fn initialize(&mut self, ctx: &mut WorkerContext) -> anyhow::Result<()> {
        ctx.channel().write_message(&["ready"])?;
        Ok(())
    }

    fn handle(&mut self, request: Command, ctx: &mut WorkerContext) -> anyhow::Result<Flow> {
        match request {
            Command::Ping => ctx.channel().write_message(&["pong"])?,
            Command::Pid => ctx
                .channel()
                .write_message(&["pid".to_string(), std::process::id().to_string()])?,
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn finalize(&mut self, ctx: &mut WorkerContext) {
        let _ = ctx.channel().write_message(&["bye"]);
    }

    fn signal_handlers(&self) -> Vec<(Signal, fn() -> Command)> {
        vec![(Signal::SIGUSR2, ping as fn() -> Command)]
    }
}

fn started() -> SupervisedWorker<Pinger> {
    let mut worker = SupervisedWorker::new(Pinger);
    worker.start().expect("starting the worker");
    assert_eq!(worker.receive().unwrap(), vec!["ready"]);
    worker
}

fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

rusty_fork_test! {
    #[test]
    fn starting_twice_is_refused() {
        let mut worker = started();
        assert_matches!(worker.start(), Err(WorkerError::AlreadyStarted));
        worker.stop().unwrap();
        assert_matches!(worker.stop(), Err(WorkerError::NotStarted));
    }

    #[test]
    fn restarts_with_a_fresh_process() {
        let mut worker = SupervisedWorker::new(Pinger);
        let mut pids = vec![];
        for _ in 0..3 {
            let pid = worker.start().unwrap();
            assert_eq!(worker.receive().unwrap(), vec!["ready"]);
            worker.send(&["pid"]).unwrap();
            assert_eq!(worker.receive().unwrap(), vec!["pid".to_string(), pid.to_string()]);
            worker.stop().unwrap();
            assert!(!worker.is_running());
            assert!(!is_alive(pid), "{} should have been reaped", pid);
            pids.push(pid);
        }
        pids.dedup();
        assert_eq!(pids.len(), 3);
    }

    #[test]
    fn finalize_runs_when_the_service_quits() {
        let mut worker = started();
        worker.send(&["ping"]).unwrap();
        assert_eq!(worker.receive().unwrap(), vec!["pong"]);
        worker.send(&["quit"]).unwrap();
        assert_eq!(worker.receive().unwrap(), vec!["bye"]);
        assert_matches!(worker.receive(), Err(WorkerError::Channel(ChannelError::Eof)));
        worker.stop().unwrap();
    }

    #[test]
    fn unknown_messages_end_the_worker() {
        let mut worker = started();
        worker.send(&["dance"]).unwrap();
        assert_eq!(worker.receive().unwrap(), vec!["bye"]);
        assert_matches!(worker.receive(), Err(WorkerError::Channel(ChannelError::Eof)));
        worker.stop().unwrap();
    }

    #[test]
    fn handled_signals_become_requests() {
        let mut worker = started();
        let pid = worker.pid().unwrap();
        kill(pid, Signal::SIGUSR2).unwrap();
        assert_eq!(worker.receive().unwrap(), vec!["pong"]);
        kill(pid, Signal::SIGUSR2).unwrap();
        assert_eq!(worker.receive().unwrap(), vec!["pong"]);
        worker.send(&["ping"]).unwrap();
        assert_eq!(worker.receive().unwrap(), vec!["pong"]);
        assert!(is_alive(pid));
        worker.stop().unwrap();
    }

    #[test]
    fn dropping_the_handle_stops_the_worker() {
        let worker = started();
        let pid = worker.pid().unwrap();
        drop(worker);
        assert!(!is_alive(pid));
    }

    #[test]
    fn descriptors_cross_process_boundaries() {
        let (mut ours, mut theirs) = MessageChannel::pair().unwrap();
        let child = process::fork_process("fd-sender", move || {
            let (read, write) = match pipe() {
                Ok(ends) => ends,
                Err(_) => return 1,
            };
            let mut write = unsafe { File::from_raw_fd(write) };
            let read = unsafe { File::from_raw_fd(read) };
            if write.write_all(b"hello from the child").is_err() {
                return 1;
            }
            drop(write);
            match theirs.send_fd(&read) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        })
        .unwrap();

        let mut received = File::from(ours.recv_fd().unwrap());
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello from the child");
        assert_matches!(
            process::wait_for(child).unwrap(),
            nix::sys::wait::WaitStatus::Exited(_, 0)
        );
    }
}
