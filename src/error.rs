//! The error taxonomy shared by the channel, the worker base and the spawners.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading from or writing to a
/// [`MessageChannel`](crate::message_channel::MessageChannel).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The peer sent (or we were about to send) something that violates the framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The stream ended in the middle of a frame, or where a frame was required.
    #[error("unexpected end of stream")]
    Eof,

    #[error("I/O error on message channel: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::Error> for ChannelError {
    fn from(e: nix::Error) -> Self {
        ChannelError::Io(e.into())
    }
}

impl ChannelError {
    /// Returns true if the channel itself failed (as opposed to the
    /// peer saying something we don't understand).
    pub fn is_transport(&self) -> bool {
        !matches!(self, ChannelError::Protocol(_))
    }
}

/// Lifecycle and dispatch errors of a [`SupervisedWorker`](crate::worker::SupervisedWorker).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker is already started")]
    AlreadyStarted,

    #[error("worker is not started")]
    NotStarted,

    /// The dispatch loop received a message name that no handler is registered for.
    #[error("unknown message {0:?} received")]
    UnknownMessage(String),

    #[error("malformed {name:?} message: {reason}")]
    MalformedMessage { name: String, reason: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("system call failed: {0}")]
    Os(#[from] nix::Error),
}

/// A serializable description of a failure that happened inside another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// What kind of failure it was: `error` for returned errors, `panic` for panics.
    pub class: String,
    pub message: String,
    /// The chain of underlying causes, outermost first.
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl ErrorReport {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorReport {
            class: class.into(),
            message: message.into(),
            backtrace: vec![],
        }
    }

    pub fn from_error(e: &anyhow::Error) -> Self {
        ErrorReport {
            class: "error".to_string(),
            message: e.to_string(),
            backtrace: e.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "(non-string panic payload)".to_string()
        };
        ErrorReport::new("panic", message)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.class, self.message)?;
        for cause in &self.backtrace {
            write!(f, "\n\tcaused by: {}", cause)?;
        }
        Ok(())
    }
}

/// Which bootstrap stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStage {
    Framework,
    Application,
}

/// The hosted application (or framework) failed to load, or exited while loading.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct InitializationError {
    pub stage: InitStage,
    pub message: String,
    /// The original failure, as reported by the process that was bootstrapping.
    pub diagnostic: Option<ErrorReport>,
}

impl InitializationError {
    pub fn raised(stage: InitStage, what: &str, report: ErrorReport) -> Self {
        InitializationError {
            stage,
            message: format!("{} raised an exception: {}", what, report),
            diagnostic: Some(report),
        }
    }

    pub fn exited(stage: InitStage, what: &str) -> Self {
        InitializationError {
            stage,
            message: format!("{} exited during startup", what),
            diagnostic: None,
        }
    }
}

/// Everything a caller of the spawner hierarchy can see go wrong.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    /// The spawner process could not be talked to. Restarting it may help.
    #[error("{what} exited unexpectedly: {source}")]
    SpawnerUnavailable {
        what: String,
        #[source]
        source: WorkerError,
    },

    #[error("invalid application root {path:?}: {reason}")]
    InvalidAppRoot { path: PathBuf, reason: String },

    #[error("spawn protocol violation: {0}")]
    Protocol(String),

    #[error("could not spawn worker process: {0}")]
    Os(#[from] nix::Error),
}

impl SpawnError {
    pub fn unavailable(what: impl Into<String>, source: impl Into<WorkerError>) -> Self {
        SpawnError::SpawnerUnavailable {
            what: what.into(),
            source: source.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, SpawnError::SpawnerUnavailable { .. })
    }
}

/// The wire representation of a [`SpawnError`], sent as a scalar blob
/// after an `exception` status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpawnFailure {
    Initialization { error: InitializationError },
    Unavailable { what: String, message: String },
    InvalidAppRoot { path: PathBuf, reason: String },
    Other { message: String },
}

impl From<&SpawnError> for SpawnFailure {
    fn from(e: &SpawnError) -> Self {
        match e {
            SpawnError::Initialization(error) => SpawnFailure::Initialization {
                error: error.clone(),
            },
            SpawnError::SpawnerUnavailable { what, source } => SpawnFailure::Unavailable {
                what: what.clone(),
                message: source.to_string(),
            },
            SpawnError::InvalidAppRoot { path, reason } => SpawnFailure::InvalidAppRoot {
                path: path.clone(),
                reason: reason.clone(),
            },
            other => SpawnFailure::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<SpawnFailure> for SpawnError {
    fn from(f: SpawnFailure) -> Self {
        match f {
            SpawnFailure::Initialization { error } => SpawnError::Initialization(error),
            SpawnFailure::Unavailable { what, message } => SpawnError::SpawnerUnavailable {
                what,
                source: WorkerError::Channel(ChannelError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    message,
                ))),
            },
            SpawnFailure::InvalidAppRoot { path, reason } => {
                SpawnError::InvalidAppRoot { path, reason }
            }
            SpawnFailure::Other { message } => SpawnError::Protocol(message),
        }
    }
}
