use anyhow::{bail, Context, Result};
use http::{Response, StatusCode};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The CGI-style request environment handed to the application.
pub type Environment = HashMap<String, String>;

/// A response body: a producer of byte chunks.
pub type Body = Box<dyn Iterator<Item = io::Result<Vec<u8>>> + Send>;

/// A body that consists of a single chunk.
pub fn full_body(data: impl Into<Vec<u8>>) -> Body {
    Box::new(std::iter::once(Ok(data.into())))
}

/// The request-serving entry point of a loaded application.
pub trait Application: Send {
    /// Runs in every freshly forked worker, before it serves its first
    /// request. Re-establish anything that mustn't be shared across
    /// processes (database connections, random seeds) here.
    fn after_fork(&mut self) -> Result<()> {
        Ok(())
    }

    fn call(&mut self, env: &Environment, input: &mut dyn Read) -> Result<Response<Body>>;
}

/// What a [`Loader`] knows about the application it is asked to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadContext {
    pub app_root: PathBuf,
    /// The deployment environment, e.g. `production`.
    pub environment: String,
}

/// Brings up frameworks and applications inside spawner processes.
pub trait Loader: Send + Sync + 'static {
    /// Which framework version the application at `app_root` wants.
    /// `None` means it can't be shared with other applications.
    fn detect_framework_version(&self, _app_root: &Path) -> Option<String> {
        None
    }

    /// Loads the framework, so that applications loaded afterwards in
    /// forked children don't need to.
    fn preload_framework(&self, _version: &str) -> Result<()> {
        Ok(())
    }

    fn load_application(&self, ctx: &LoadContext) -> Result<Box<dyn Application>>;
}

/// Returned by loaders when the application deliberately exited while
/// it was being loaded, as opposed to failing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("application exited during startup with status {0}")]
pub struct ApplicationExit(pub i32);

/// Serves the contents of `index.html` in the application root (or a
/// greeting, if there is none) for every request. Applications can
/// declare a framework version in a `.framework-version` file.
#[derive(Debug, Default)]
pub struct StaticSiteLoader;

const VERSION_FILE: &str = ".framework-version";
const INDEX_FILE: &str = "index.html";

impl Loader for StaticSiteLoader {
    fn detect_framework_version(&self, app_root: &Path) -> Option<String> {
        let version = fs::read_to_string(app_root.join(VERSION_FILE)).ok()?;
        let version = version.trim();
        if version.is_empty() {
            None
        } else {
            Some(version.to_string())
        }
    }

    fn load_application(&self, ctx: &LoadContext) -> Result<Box<dyn Application>> {
        if !ctx.app_root.is_dir() {
            bail!("{:?} is not a directory", ctx.app_root);
        }
        let index = ctx.app_root.join(INDEX_FILE);
        let content = if index.exists() {
            fs::read(&index).with_context(|| format!("reading {:?}", index))?
        } else {
            format!("Hello from {}\n", ctx.app_root.display()).into_bytes()
        };
        Ok(Box::new(StaticSite {
            content,
            environment: ctx.environment.clone(),
        }))
    }
}

struct StaticSite {
    content: Vec<u8>,
    environment: String,
}

impl Application for StaticSite {
    fn call(&mut self, env: &Environment, _input: &mut dyn Read) -> Result<Response<Body>> {
        let status = match env.get("REQUEST_METHOD").map(String::as_str) {
            Some("GET") | Some("HEAD") | None => StatusCode::OK,
            Some(_) => StatusCode::METHOD_NOT_ALLOWED,
        };
        let body = if status == StatusCode::OK {
            full_body(self.content.clone())
        } else {
            full_body(Vec::new())
        };
        Ok(Response::builder()
            .status(status)
            .header("Content-Type", "text/html")
            .header("X-Zellkern-Environment", self.environment.as_str())
            .body(body)?)
    }
}
