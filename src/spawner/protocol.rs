//! The spawn request and reply messages, and the init status report
//! of bootstrapping processes.

use super::{AppProcess, BootFailure, SpawnOptions};
use crate::error::{ChannelError, ErrorReport, SpawnError, SpawnFailure, WorkerError};
use crate::message_channel::{pairs_into_map, MessageChannel};
use crate::process::Identity;
use crate::worker::FromMessage;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SPAWN_APPLICATION: &str = "spawn_application";
const RELOAD: &str = "reload";

const APP_ROOT: &str = "app_root";
const ENVIRONMENT: &str = "environment";
const LOWER_PRIVILEGE: &str = "lower_privilege";
const USER: &str = "user";
const GROUP: &str = "group";
const FRAMEWORK_SPAWNER_TIMEOUT: &str = "framework_spawner_timeout";
const APP_SPAWNER_TIMEOUT: &str = "app_spawner_timeout";

/// Requests understood by framework spawners and the spawn server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnRequest {
    SpawnApplication(SpawnOptions),
    /// Forget preloaded code for one application root, or for all of them.
    Reload(Option<PathBuf>),
}

fn optional(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

impl SpawnRequest {
    /// Spawn options travel as key/value pairs after the message name.
    /// Spawner timeouts are whole seconds, -1 meaning the default.
    pub fn to_message(&self) -> Vec<String> {
        match self {
            SpawnRequest::SpawnApplication(options) => {
                let mut message = vec![
                    SPAWN_APPLICATION.to_string(),
                    APP_ROOT.to_string(),
                    options.app_root.to_string_lossy().into_owned(),
                    ENVIRONMENT.to_string(),
                    options.environment.clone(),
                    LOWER_PRIVILEGE.to_string(),
                    options.lower_privilege.to_string(),
                ];
                for (key, value) in &[(USER, &options.identity.user), (GROUP, &options.identity.group)] {
                    if let Some(value) = value {
                        message.push(key.to_string());
                        message.push(value.clone());
                    }
                }
                for (key, timeout) in &[
                    (FRAMEWORK_SPAWNER_TIMEOUT, options.framework_spawner_timeout),
                    (APP_SPAWNER_TIMEOUT, options.app_spawner_timeout),
                ] {
                    if let Some(timeout) = timeout {
                        message.push(key.to_string());
                        message.push(timeout.as_secs().to_string());
                    }
                }
                message
            }
            SpawnRequest::Reload(root) => vec![
                RELOAD.to_string(),
                root.as_ref()
                    .map(|root| root.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ],
        }
    }
}

impl FromMessage for SpawnRequest {
    fn from_message(message: Vec<String>) -> Result<Self, WorkerError> {
        let name = match message.first() {
            Some(name) => name.as_str(),
            None => return Err(WorkerError::UnknownMessage(String::new())),
        };
        let malformed = |reason: &str| WorkerError::MalformedMessage {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match name {
            SPAWN_APPLICATION => {
                let mut options = pairs_into_map(message[1..].to_vec())
                    .map_err(|_| malformed("options must be key/value pairs"))?;
                let app_root = match options.remove(APP_ROOT) {
                    Some(root) if !root.is_empty() => PathBuf::from(root),
                    _ => return Err(malformed("application root is missing")),
                };
                let lower_privilege = match options.remove(LOWER_PRIVILEGE) {
                    Some(flag) => flag
                        .parse::<bool>()
                        .map_err(|_| malformed("lower_privilege must be true or false"))?,
                    None => true,
                };
                let mut timeout = |key: &str| match options.remove(key) {
                    Some(secs) => match secs.parse::<i64>() {
                        Ok(secs) if secs < 0 => Ok(None),
                        Ok(secs) => Ok(Some(Duration::from_secs(secs as u64))),
                        Err(_) => Err(malformed("spawner timeouts must be whole seconds")),
                    },
                    None => Ok(None),
                };
                let framework_spawner_timeout = timeout(FRAMEWORK_SPAWNER_TIMEOUT)?;
                let app_spawner_timeout = timeout(APP_SPAWNER_TIMEOUT)?;
                let mut field = |key: &str| options.remove(key).and_then(|v| optional(&v));
                Ok(SpawnRequest::SpawnApplication(SpawnOptions {
                    app_root,
                    identity: Identity {
                        user: field(USER),
                        group: field(GROUP),
                    },
                    environment: field(ENVIRONMENT).unwrap_or_else(|| "production".to_string()),
                    lower_privilege,
                    framework_spawner_timeout,
                    app_spawner_timeout,
                }))
            }
            RELOAD => match &message[1..] {
                [] => Ok(SpawnRequest::Reload(None)),
                [root] => Ok(SpawnRequest::Reload(optional(root).map(PathBuf::from))),
                _ => Err(malformed("expected at most 1 argument")),
            },
            _ => Err(WorkerError::UnknownMessage(name.to_string())),
        }
    }
}

/// Sends the answer to a spawn request.
pub fn send_spawn_reply(
    channel: &mut MessageChannel,
    reply: Result<&AppProcess, &SpawnError>,
) -> Result<(), ChannelError> {
    match reply {
        Ok(process) => {
            channel.write_message(&[
                "ok".to_string(),
                process.pid.as_raw().to_string(),
                process.socket_path.to_string_lossy().into_owned(),
            ])?;
            channel.send_fd(&process.listener)?;
            channel.send_fd(&process.owner_pipe)
        }
        Err(e) => {
            let failure = SpawnFailure::from(e);
            let blob = serde_json::to_vec(&failure)
                .map_err(|e| ChannelError::Protocol(format!("could not encode failure: {}", e)))?;
            channel.write_message(&["exception"])?;
            channel.write_scalar(&blob)
        }
    }
}

/// Maps a channel error to the typed error callers of spawners see.
/// Any failure of the channel itself makes the spawner unavailable.
pub fn transport_error(what: &str, e: ChannelError) -> SpawnError {
    if e.is_transport() {
        SpawnError::unavailable(what, e)
    } else {
        SpawnError::Protocol(format!("{}: {}", what, e))
    }
}

/// Reads the answer to a spawn request that was sent on `channel`.
pub fn receive_spawn_reply(
    channel: &mut MessageChannel,
    app_root: &Path,
    what: &str,
) -> Result<AppProcess, SpawnError> {
    let transport = |e| transport_error(what, e);
    let reply = channel
        .read_message()
        .map_err(transport)?
        .ok_or_else(|| transport(ChannelError::Eof))?;
    match reply.as_slice() {
        [status, pid, socket_path] if status == "ok" => {
            let pid: i32 = pid
                .parse()
                .map_err(|_| SpawnError::Protocol(format!("{}: invalid pid {:?}", what, pid)))?;
            let listener = channel.recv_fd().map_err(transport)?;
            let owner_pipe = channel.recv_fd().map_err(transport)?;
            Ok(AppProcess {
                app_root: app_root.to_path_buf(),
                pid: Pid::from_raw(pid),
                socket_path: PathBuf::from(socket_path),
                listener,
                owner_pipe,
            })
        }
        [status] if status == "exception" => {
            let blob = channel
                .read_scalar()
                .map_err(transport)?
                .ok_or_else(|| transport(ChannelError::Eof))?;
            let failure: SpawnFailure = serde_json::from_slice(&blob).map_err(|e| {
                SpawnError::Protocol(format!("{}: undecodable failure report: {}", what, e))
            })?;
            Err(failure.into())
        }
        other => Err(SpawnError::Protocol(format!(
            "{}: unexpected reply {:?}",
            what, other
        ))),
    }
}

/// Reports that bootstrapping succeeded.
pub fn report_success(channel: &mut MessageChannel) -> Result<(), ChannelError> {
    channel.write_message(&["success"])
}

pub(crate) fn report_failure(
    channel: &mut MessageChannel,
    failure: &BootFailure,
) -> Result<(), ChannelError> {
    match failure {
        BootFailure::Exited => channel.write_message(&["exit"]),
        BootFailure::Raised(report) => send_report(channel, report),
    }
}

fn send_report(channel: &mut MessageChannel, report: &ErrorReport) -> Result<(), ChannelError> {
    let blob = serde_json::to_vec(report)
        .map_err(|e| ChannelError::Protocol(format!("could not encode error report: {}", e)))?;
    channel.write_message(&["exception"])?;
    channel.write_scalar(&blob)
}
