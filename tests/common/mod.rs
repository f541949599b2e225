#![allow(dead_code)]

use anyhow::{bail, Result};
use http::Response;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use zellkern::application::{full_body, Application, ApplicationExit, Body, Environment, LoadContext, Loader};
use zellkern::configuration::{Config, SpawnMethod};
use zellkern::message_channel::MessageChannel;
use zellkern::spawner::{AppProcess, Hosting};

/// A fresh, empty directory under the system temp dir.
pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "zellkern-test-{}-{}",
        label,
        uuid::Uuid::new_v4().to_simple()
    ));
    fs::create_dir_all(&dir).expect("creating scratch dir");
    dir
}

pub fn test_config(spawn_method: SpawnMethod) -> Config {
    let mut config = Config::default();
    config.spawner.spawn_method = spawn_method;
    config.spawner.stop_timeout = Duration::from_secs(1);
    config.privileges.lower_privilege = false;
    config.request_handler.socket_dir = Some(scratch_dir("sockets"));
    config.request_handler.accept_poll_interval = Duration::from_millis(200);
    config
}

pub fn hosting(loader: impl Loader, spawn_method: SpawnMethod) -> Hosting {
    Hosting::new(Arc::new(loader), test_config(spawn_method))
}

/// Answers every request with the pid of the process that loaded it,
/// followed by the pid serving the request and the request path.
pub struct PidApp {
    loaded_by: u32,
}

impl Application for PidApp {
    fn call(&mut self, env: &Environment, input: &mut dyn Read) -> Result<Response<Body>> {
        let mut body = String::new();
        input.read_to_string(&mut body)?;
        let path = env.get("PATH_INFO").cloned().unwrap_or_default();
        Ok(Response::builder().status(200).body(full_body(format!(
            "{} {} {}{}",
            self.loaded_by,
            std::process::id(),
            path,
            body
        )))?)
    }
}

/// Loads a [`PidApp`]. Application roots containing a `framework`
/// file share the framework version named in it.
#[derive(Default)]
pub struct PidLoader;

impl Loader for PidLoader {
    fn detect_framework_version(&self, app_root: &Path) -> Option<String> {
        fs::read_to_string(app_root.join("framework"))
            .ok()
            .map(|v| v.trim().to_string())
    }

    fn load_application(&self, _ctx: &LoadContext) -> Result<Box<dyn Application>> {
        Ok(Box::new(PidApp {
            loaded_by: std::process::id(),
        }))
    }
}

/// How a [`BrokenLoader`] fails.
#[derive(Clone, Copy)]
pub enum Breakage {
    Error,
    Panic,
    Exit,
    Framework,
}

pub struct BrokenLoader(pub Breakage);

impl Loader for BrokenLoader {
    fn detect_framework_version(&self, _app_root: &Path) -> Option<String> {
        Some("9.9".to_string())
    }

    fn preload_framework(&self, version: &str) -> Result<()> {
        match self.0 {
            Breakage::Framework => bail!("no framework {} here: boom", version),
            _ => Ok(()),
        }
    }

    fn load_application(&self, ctx: &LoadContext) -> Result<Box<dyn Application>> {
        match self.0 {
            Breakage::Error => bail!("boom"),
            Breakage::Panic => panic!("boom"),
            Breakage::Exit => Err(ApplicationExit(3).into()),
            Breakage::Framework => PidLoader.load_application(ctx),
        }
    }
}

/// Connects to a worker and sends the headers of a request whose body
/// is `content_length` bytes long, but not the body itself.
pub fn start_request(process: &AppProcess, path: &str, content_length: usize) -> UnixStream {
    let stream = UnixStream::connect(&process.socket_path).expect("connecting to worker");
    let length = content_length.to_string();
    let mut headers = Vec::new();
    for (key, value) in &[
        ("REQUEST_METHOD", "POST"),
        ("PATH_INFO", path),
        ("CONTENT_LENGTH", length.as_str()),
    ] {
        headers.extend_from_slice(key.as_bytes());
        headers.push(0);
        headers.extend_from_slice(value.as_bytes());
        headers.push(0);
    }
    MessageChannel::new(&stream)
        .write_scalar(&headers)
        .expect("sending headers");
    stream
}

/// Sends the body of a started request and returns the raw response.
/// A worker that died mid-request yields an empty response.
pub fn finish_request(stream: UnixStream, body: &str) -> String {
    let _ = (&stream).write_all(body.as_bytes());
    let mut response = String::new();
    let _ = (&stream).read_to_string(&mut response);
    response
}

/// Sends one request to a worker and returns the response body.
pub fn request(process: &AppProcess, path: &str, body: &str) -> String {
    let stream = start_request(process, path, body.len());
    let response = finish_request(stream, body);
    response_body(&response)
}

/// Checks that `response` is a successful one and strips its headers.
pub fn response_body(response: &str) -> String {
    assert!(response.starts_with("Status: 200 OK\r\n"), "{}", response);
    match response.find("\r\n\r\n") {
        Some(end) => response[end + 4..].to_string(),
        None => panic!("no end of headers in {:?}", response),
    }
}

/// The pid of the process that loaded the application, according to
/// a [`PidApp`] response.
pub fn loaded_by(response: &str) -> u32 {
    response
        .split(' ')
        .next()
        .and_then(|pid| pid.parse().ok())
        .expect("pid in response")
}

/// Polls `condition` for up to five seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}
