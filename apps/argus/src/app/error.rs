use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::sensor::SensorError;
use crate::transport::TransportError;
use crate::viewer::ViewerError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("sensor failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("viewer failed: {0}")]
    Viewer(#[from] ViewerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("no sensor connected within {0} seconds")]
    NoSensor(u64),
    #[error("{0} mode requires the webrtc-provider feature")]
    Unsupported(&'static str),
}
