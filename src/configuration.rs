use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Config {
    #[serde(default)]
    pub spawner: SpawnerConfig,

    #[serde(default)]
    pub request_handler: RequestHandlerConfig,

    #[serde(default)]
    pub privileges: PrivilegeConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SpawnerConfig {
    /// How often cached spawners are checked for idleness. Default: 125s
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,

    /// Cached application spawners that haven't spawned anything for
    /// longer than this are stopped. Default: 120s
    #[serde(default = "default_max_idle_time", with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Framework spawners idle for longer than this are stopped by the
    /// dispatcher. Zero means they are kept until reloaded. Default: 0s
    #[serde(default, with = "humantime_serde")]
    pub framework_max_idle_time: Duration,

    /// How long `stop` waits for a spawner process to exit before it
    /// gets killed. Default: 3s
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Which spawner family the dispatcher uses. Default: smart
    #[serde(default)]
    pub spawn_method: SpawnMethod,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        SpawnerConfig {
            reaper_interval: default_reaper_interval(),
            max_idle_time: default_max_idle_time(),
            framework_max_idle_time: Duration::from_secs(0),
            stop_timeout: default_stop_timeout(),
            spawn_method: SpawnMethod::default(),
        }
    }
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(125)
}

fn default_max_idle_time() -> Duration {
    Duration::from_secs(120)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(3)
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SpawnMethod {
    /// Preload the framework once per framework version, and each
    /// application once on top of that.
    Smart,

    /// Preload each application, without sharing a framework spawner.
    SmartLv2,

    /// Don't preload anything: every worker loads the application from scratch.
    Conservative,
}

impl Default for SpawnMethod {
    fn default() -> Self {
        SpawnMethod::Smart
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RequestHandlerConfig {
    /// The longest a worker waits for a connection before checking
    /// whether its owner is still around. Default: 60s
    #[serde(default = "default_accept_poll_interval", with = "humantime_serde")]
    pub accept_poll_interval: Duration,

    /// Largest accepted request header blob, in bytes. Default: 128KiB
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,

    /// Directory in which workers create their listening sockets.
    /// Defaults to the system's temporary directory.
    pub socket_dir: Option<PathBuf>,
}

impl Default for RequestHandlerConfig {
    fn default() -> Self {
        RequestHandlerConfig {
            accept_poll_interval: default_accept_poll_interval(),
            max_header_size: default_max_header_size(),
            socket_dir: None,
        }
    }
}

impl RequestHandlerConfig {
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn default_accept_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_header_size() -> usize {
    128 * 1024
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PrivilegeConfig {
    /// When running as root, switch workers to a less privileged user. Default: true
    #[serde(default = "default_lower_privilege")]
    pub lower_privilege: bool,

    /// The user to fall back to if the application root is owned by root. Default: nobody
    #[serde(default = "default_lowest_user")]
    pub lowest_user: String,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        PrivilegeConfig {
            lower_privilege: default_lower_privilege(),
            lowest_user: default_lowest_user(),
        }
    }
}

fn default_lower_privilege() -> bool {
    true
}

fn default_lowest_user() -> String {
    "nobody".to_string()
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Critical => slog::Level::Critical,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LogFormat {
    Json,
    Logfmt {
        #[serde(default)]
        print_prefix: bool,
    },
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Logfmt { print_prefix: false }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogOutput {
    Stderr,
    Stdout,
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Stderr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::from_str(toml, config::FileFormat::Toml))
            .unwrap();
        settings.try_into::<Config>().unwrap()
    }

    #[test]
    fn empty_file_has_defaults() {
        let config = parse("");
        assert_eq!(config, Config::default());
        assert_eq!(config.spawner.reaper_interval, Duration::from_secs(125));
        assert_eq!(config.spawner.max_idle_time, Duration::from_secs(120));
        assert_eq!(
            config.request_handler.accept_poll_interval,
            Duration::from_secs(60)
        );
        assert_eq!(config.privileges.lowest_user, "nobody");
    }

    #[test]
    fn overrides() {
        let config = parse(
            r#"
[spawner]
reaper_interval = "5s"
max_idle_time = "2m"
spawn_method = "smart_lv2"

[request_handler]
max_header_size = 1024
socket_dir = "/run/zellkern"

[log]
level = "debug"
format = { type = "json" }
"#,
        );
        assert_eq!(config.spawner.reaper_interval, Duration::from_secs(5));
        assert_eq!(config.spawner.max_idle_time, Duration::from_secs(120));
        assert_eq!(config.spawner.spawn_method, SpawnMethod::SmartLv2);
        assert_eq!(config.request_handler.max_header_size, 1024);
        assert_eq!(
            config.request_handler.socket_dir(),
            PathBuf::from("/run/zellkern")
        );
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
    }
}
