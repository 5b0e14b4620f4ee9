pub mod app;
pub mod auth;
pub mod capture;
pub mod config;
pub mod handshake;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod sensor;
pub mod telemetry;
pub mod transport;
pub mod viewer;
