use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::SecretBinding;
use crate::capture::MAX_FPS;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "argus",
    about = "Peer-to-peer camera: stream from a sensor, watch from a viewer",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "ARGUS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "ARGUS_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture locally and serve authenticated viewers
    Sensor(SensorArgs),
    /// Discover the sensors of a site and watch them
    Viewer(ViewerArgs),
    /// Run a sensor and a viewer in-process and report the first connection
    Loopback(LoopbackArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct NetworkArgs {
    #[arg(
        long = "registry-url",
        value_name = "URL",
        help = "Discovery registry base URL (overrides ARGUS_REGISTRY_URL)"
    )]
    pub registry_url: Option<String>,

    #[arg(
        long = "signaling-url",
        value_name = "URL",
        help = "WebSocket signaling broker (overrides ARGUS_SIGNALING_URL)"
    )]
    pub signaling_url: Option<String>,

    #[arg(
        long = "secret-binding",
        value_enum,
        help = "Derive the credential from the password alone or from site and password"
    )]
    pub binding: Option<SecretBinding>,
}

#[derive(Args, Debug, Clone)]
pub struct SensorArgs {
    #[arg(long, env = "ARGUS_SITE")]
    pub site: String,

    #[arg(long, help = "Display name sent to viewers")]
    pub name: String,

    #[arg(long, env = "ARGUS_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(
        long,
        default_value_t = 15,
        value_parser = clap::value_parser!(u32).range(1..=MAX_FPS as i64),
        help = "Synthetic capture frame rate"
    )]
    pub fps: u32,

    #[command(flatten)]
    pub network: NetworkArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ViewerArgs {
    #[arg(long, env = "ARGUS_SITE")]
    pub site: String,

    #[arg(long, env = "ARGUS_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[command(flatten)]
    pub network: NetworkArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoopbackArgs {
    #[arg(long, default_value = "lab")]
    pub site: String,

    #[arg(long, default_value = "Cam1")]
    pub name: String,

    #[arg(long, default_value = "loopback", hide_default_value = true)]
    pub password: String,

    #[arg(
        long = "wait-secs",
        default_value_t = 10,
        help = "Give up if no sensor connects within this many seconds"
    )]
    pub wait_secs: u64,
}
