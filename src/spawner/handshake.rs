//! Waiting for a bootstrapping process to report how it went.

use crate::error::{ChannelError, ErrorReport, InitStage, InitializationError, SpawnError};
use crate::message_channel::MessageChannel;
use super::protocol::transport_error;
use machine::*;
use slog_scope::{debug, warn};

/// One step of the init status report, as read off the channel.
#[derive(Clone, PartialEq, Debug)]
pub enum InitStatus {
    Success,
    Exception,
    Exit,
    Report(ErrorReport),
    Unexpected(Vec<String>),
}

impl From<Vec<String>> for InitStatus {
    fn from(message: Vec<String>) -> Self {
        match message.as_slice() {
            [status] if status == "success" => InitStatus::Success,
            [status] if status == "exception" => InitStatus::Exception,
            [status] if status == "exit" => InitStatus::Exit,
            _ => InitStatus::Unexpected(message),
        }
    }
}

machine! {
    #[derive(Clone, PartialEq, Debug)]
    pub enum Handshake {
        Awaiting,
        ReportPending,
        Succeeded,
        Raised { report: ErrorReport },
        Exited,
    }
}

transitions!(Handshake, [
    (Awaiting, InitStatus) => [Succeeded, ReportPending, Exited, Error],
    (ReportPending, InitStatus) => [Raised, Error]
]);

impl Awaiting {
    pub fn on_init_status(self, status: InitStatus) -> Handshake {
        match status {
            InitStatus::Success => Handshake::succeeded(),
            InitStatus::Exception => Handshake::report_pending(),
            InitStatus::Exit => Handshake::exited(),
            other => {
                warn!("unexpected init status"; "status" => ?other);
                Handshake::Error
            }
        }
    }
}

impl ReportPending {
    pub fn on_init_status(self, status: InitStatus) -> Handshake {
        match status {
            InitStatus::Report(report) => Handshake::raised(report),
            other => {
                warn!("expected an error report"; "status" => ?other);
                Handshake::Error
            }
        }
    }
}

/// Reads the init status report from `channel` and turns it into a
/// result: `Ok` if the process on the other end bootstrapped fine.
pub fn await_init_status(
    channel: &mut MessageChannel,
    stage: InitStage,
    what: &str,
) -> Result<(), SpawnError> {
    let transport = |e| transport_error(what, e);
    let mut state = Handshake::awaiting();
    loop {
        state = match state {
            Handshake::Awaiting(_) => {
                let message = channel
                    .read_message()
                    .map_err(transport)?
                    .ok_or_else(|| transport(ChannelError::Eof))?;
                state.on_init_status(message.into())
            }
            Handshake::ReportPending(_) => {
                let blob = channel
                    .read_scalar()
                    .map_err(transport)?
                    .ok_or_else(|| transport(ChannelError::Eof))?;
                let report: ErrorReport = serde_json::from_slice(&blob).map_err(|e| {
                    SpawnError::Protocol(format!("{}: undecodable error report: {}", what, e))
                })?;
                state.on_init_status(InitStatus::Report(report))
            }
            Handshake::Succeeded(_) => {
                debug!("bootstrapped"; "what" => what);
                return Ok(());
            }
            Handshake::Raised(Raised { report }) => {
                return Err(InitializationError::raised(stage, what, report).into())
            }
            Handshake::Exited(_) => return Err(InitializationError::exited(stage, what).into()),
            Handshake::Error => {
                return Err(SpawnError::Protocol(format!(
                    "{}: garbled initialization status",
                    what
                )))
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::protocol::{report_failure, report_success};
    use crate::spawner::BootFailure;
    use matches::assert_matches;

    fn handshake(send: impl FnOnce(&mut MessageChannel)) -> Result<(), SpawnError> {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        send(&mut a);
        drop(a);
        await_init_status(&mut b, InitStage::Application, "Application '/app'")
    }

    #[test]
    fn success() {
        assert!(handshake(|c| report_success(c).unwrap()).is_ok());
    }

    #[test]
    fn exception_carries_the_report() {
        let result = handshake(|c| {
            report_failure(c, &BootFailure::Raised(ErrorReport::new("error", "boom"))).unwrap()
        });
        match result {
            Err(SpawnError::Initialization(e)) => {
                assert_eq!(e.stage, InitStage::Application);
                assert!(e.message.contains("boom"));
                assert_eq!(e.diagnostic.unwrap().message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn exit() {
        assert_matches!(
            handshake(|c| report_failure(c, &BootFailure::Exited).unwrap()),
            Err(SpawnError::Initialization(InitializationError { diagnostic: None, .. }))
        );
    }

    #[test]
    fn silence_means_unavailable() {
        assert!(handshake(|_| ()).unwrap_err().is_unavailable());
    }

    #[test]
    fn garbage() {
        assert_matches!(
            handshake(|c| c.write_message(&["hello"]).unwrap()),
            Err(SpawnError::Protocol(_))
        );
        assert_matches!(
            handshake(|c| {
                c.write_message(&["exception"]).unwrap();
                c.write_scalar(b"not json").unwrap();
            }),
            Err(SpawnError::Protocol(_))
        );
    }
}
