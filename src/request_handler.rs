use crate::application::{Application, Body, Environment};
use crate::configuration::RequestHandlerConfig;
use crate::message_channel::{split_null_delimited_pairs, MessageChannel};
use crate::signals::{self, SignalScope, HARD_TERMINATION_SIGNAL, SOFT_TERMINATION_SIGNAL};
use anyhow::{Context, Result};
use http::{Response, StatusCode};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use slog_scope::{debug, info, warn};
use std::fs;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Creates the owner pipe: `(read end, write end)`.
pub fn owner_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    unsafe { Ok((OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write))) }
}

/// Binds a listening socket with a unique name in `socket_dir`.
pub fn bind_listener(socket_dir: &Path) -> io::Result<(UnixListener, PathBuf)> {
    let name = format!("zellkern.{}", uuid::Uuid::new_v4().to_simple());
    let path = socket_dir.join(name);
    let listener = UnixListener::bind(&path)?;
    Ok((listener, path))
}

/// Fills in the canonical CGI keys from their HTTP-prefixed aliases.
pub fn normalize_headers(env: &mut Environment) {
    for (canonical, alias) in &[
        ("CONTENT_LENGTH", "HTTP_CONTENT_LENGTH"),
        ("CONTENT_TYPE", "HTTP_CONTENT_TYPE"),
    ] {
        if !env.contains_key(*canonical) {
            if let Some(value) = env.get(*alias).cloned() {
                env.insert(canonical.to_string(), value);
            }
        }
    }
}

/// Writes `response` in CGI format.
pub fn write_response<W: Write>(out: &mut W, response: Response<Body>) -> io::Result<()> {
    let (parts, body) = response.into_parts();
    write!(
        out,
        "Status: {} {}\r\n",
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or("Unknown")
    )?;
    for (name, value) in parts.headers.iter() {
        out.write_all(name.as_str().as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(value.as_bytes())?;
        out.write_all(b"\r\n")?;
    }
    out.write_all(b"\r\n")?;
    for chunk in body {
        out.write_all(&chunk?)?;
    }
    out.flush()
}

fn error_response() -> Response<Body> {
    let mut response = Response::new(crate::application::full_body(
        &b"Internal Server Error\n"[..],
    ));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Serves the single request on `stream`.
pub fn serve_connection(
    app: &mut dyn Application,
    stream: &UnixStream,
    max_header_size: usize,
) -> Result<()> {
    let mut channel = MessageChannel::new(stream);
    let headers = match channel.read_scalar_limited(Some(max_header_size))? {
        Some(headers) => headers,
        None => {
            debug!("client closed the connection before sending headers");
            return Ok(());
        }
    };
    let mut env = split_null_delimited_pairs(&headers)?;
    normalize_headers(&mut env);

    let content_length = env
        .get("CONTENT_LENGTH")
        .and_then(|len| len.parse::<u64>().ok());
    let mut raw_input = stream;
    let mut limited;
    let input: &mut dyn Read = match content_length {
        Some(len) => {
            limited = raw_input.take(len);
            &mut limited
        }
        None => &mut raw_input,
    };

    let response = match app.call(&env, input) {
        Ok(response) => response,
        Err(e) => {
            warn!("application failed to handle request"; "error" => %e, "path" => ?env.get("PATH_INFO"));
            error_response()
        }
    };
    let mut output = stream;
    write_response(&mut output, response)?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

/// Why the accept loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The soft termination signal arrived.
    Graceful,
    /// A hard termination signal or an interrupt arrived while idle.
    Terminated,
    /// The owner pipe's read end was closed.
    Abandoned,
}

pub struct RequestHandler<'a> {
    app: &'a mut dyn Application,
    listener: UnixListener,
    socket_path: PathBuf,
    owner_pipe: OwnedFd,
    accept_poll_interval: Duration,
    max_header_size: usize,
}

impl<'a> RequestHandler<'a> {
    pub fn new(
        app: &'a mut dyn Application,
        listener: UnixListener,
        socket_path: PathBuf,
        owner_pipe: OwnedFd,
        config: &RequestHandlerConfig,
    ) -> Self {
        RequestHandler {
            app,
            listener,
            socket_path,
            owner_pipe,
            accept_poll_interval: config.accept_poll_interval,
            max_header_size: config.max_header_size,
        }
    }

    fn poll_timeout(&self) -> i32 {
        self.accept_poll_interval.as_millis().min(i32::MAX as u128) as i32
    }

    /// Accepts and serves connections until the worker is told to stop
    /// or abandoned by its owner. Removes the socket file on the way out.
    pub fn main_loop(&mut self) -> Result<Exit> {
        let result = self.accept_loop();
        if let Err(e) = fs::remove_file(&self.socket_path) {
            debug!("could not remove socket"; "path" => ?self.socket_path, "error" => %e);
        }
        result
    }

    fn accept_loop(&mut self) -> Result<Exit> {
        let scope = SignalScope::arm(&[
            HARD_TERMINATION_SIGNAL,
            SOFT_TERMINATION_SIGNAL,
            Signal::SIGINT,
        ])?;
        self.listener.set_nonblocking(true)?;
        info!("serving requests"; "socket" => ?self.socket_path);
        loop {
            if signals::take_pending(HARD_TERMINATION_SIGNAL) || signals::take_pending(Signal::SIGINT) {
                return Ok(Exit::Terminated);
            }
            if signals::take_pending(SOFT_TERMINATION_SIGNAL) {
                return Ok(Exit::Graceful);
            }

            let mut fds = [
                PollFd::new(self.listener.as_raw_fd(), PollFlags::POLLIN),
                PollFd::new(self.owner_pipe.as_raw_fd(), PollFlags::empty()),
                PollFd::new(scope.wakeup_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, self.poll_timeout()) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("waiting for connections"),
            }
            let ready = |fd: &PollFd| fd.revents().map_or(false, |r| !r.is_empty());
            if ready(&fds[1]) {
                debug!("owner pipe closed");
                return Ok(Exit::Abandoned);
            }
            if ready(&fds[2]) {
                scope.drain_wakeups();
                continue;
            }
            if !ready(&fds[0]) {
                continue;
            }
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accepting a connection"),
            };
            // While a request is in flight, only the soft termination
            // signal is deferred; everything else has its usual effect.
            let _in_request = SignalScope::arm(&[SOFT_TERMINATION_SIGNAL])?;
            stream.set_nonblocking(false)?;
            if let Err(e) = serve_connection(&mut *self.app, &stream, self.max_header_size) {
                warn!("failed to serve connection"; "error" => %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::full_body;
    use std::io::Cursor;

    struct Upcase;

    impl Application for Upcase {
        fn call(&mut self, env: &Environment, input: &mut dyn Read) -> Result<Response<Body>> {
            let mut body = String::new();
            input.read_to_string(&mut body)?;
            let body = format!("{} {}", env["PATH_INFO"], body.to_uppercase());
            Ok(Response::builder()
                .status(201)
                .header("X-Length", env["CONTENT_LENGTH"].as_str())
                .body(full_body(body))?)
        }
    }

    #[test]
    fn aliases_fill_in_missing_keys() {
        let mut env = Environment::new();
        env.insert("HTTP_CONTENT_LENGTH".to_string(), "12".to_string());
        env.insert("CONTENT_TYPE".to_string(), "text/plain".to_string());
        env.insert("HTTP_CONTENT_TYPE".to_string(), "text/html".to_string());
        normalize_headers(&mut env);
        assert_eq!(env["CONTENT_LENGTH"], "12");
        assert_eq!(env["CONTENT_TYPE"], "text/plain");
    }

    #[test]
    fn responses_are_written_cgi_style() {
        let response = Response::builder()
            .status(404)
            .header("Content-Type", "text/plain")
            .body(full_body(&b"nope"[..]))
            .unwrap();
        let mut out = Cursor::new(vec![]);
        write_response(&mut out, response).unwrap();
        assert_eq!(
            String::from_utf8(out.into_inner()).unwrap(),
            "Status: 404 Not Found\r\ncontent-type: text/plain\r\n\r\nnope"
        );
    }

    #[test]
    fn serves_one_request_per_connection() {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            serve_connection(&mut Upcase, &server, 1024).unwrap();
        });
        let mut channel = MessageChannel::new(&client);
        channel
            .write_scalar(b"PATH_INFO\0/shout\0HTTP_CONTENT_LENGTH\x005\0")
            .unwrap();
        (&client).write_all(b"hello").unwrap();
        let mut response = String::new();
        (&client).read_to_string(&mut response).unwrap();
        handle.join().unwrap();
        assert!(response.starts_with("Status: 201 Created\r\n"), "{}", response);
        assert!(response.contains("x-length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\n/shout HELLO"));
    }

    #[test]
    fn oversized_headers_are_refused() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut channel = MessageChannel::new(&client);
        channel.write_scalar(&[b'a'; 64]).unwrap();
        assert!(serve_connection(&mut Upcase, &server, 16).is_err());
    }
}
