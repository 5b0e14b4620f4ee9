use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::auth::SecretBinding;
use crate::model::Site;
use crate::sensor::SensorConfig;
use crate::viewer::ViewerConfig;

pub const DEFAULT_REGISTRY_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:9000";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("discover interval ({discover:?}) must not be shorter than the handshake timeout ({timeout:?})")]
    DiscoverFasterThanHandshake { discover: Duration, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct ArgusConfig {
    pub registry_url: String,
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub announce_interval: Duration,
    pub discover_interval: Duration,
    pub handshake_timeout: Duration,
    pub binding: SecretBinding,
}

impl ArgusConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = env::var("ARGUS_ICE_SERVERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|server| !server.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);
        let binding = match env::var("ARGUS_SECRET_BINDING").ok().as_deref() {
            Some("site-and-password") | Some("site") => SecretBinding::SiteAndPassword,
            _ => defaults.binding,
        };

        Self {
            registry_url: non_empty_var("ARGUS_REGISTRY_URL").unwrap_or(defaults.registry_url),
            signaling_url: non_empty_var("ARGUS_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            ice_servers,
            announce_interval: secs_var("ARGUS_ANNOUNCE_INTERVAL_SECS")
                .unwrap_or(defaults.announce_interval),
            discover_interval: secs_var("ARGUS_DISCOVER_INTERVAL_SECS")
                .unwrap_or(defaults.discover_interval),
            handshake_timeout: secs_var("ARGUS_HANDSHAKE_TIMEOUT_SECS")
                .unwrap_or(defaults.handshake_timeout),
            binding,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("announce interval"));
        }
        if self.discover_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("discover interval"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("handshake timeout"));
        }
        if self.discover_interval < self.handshake_timeout {
            return Err(ConfigError::DiscoverFasterThanHandshake {
                discover: self.discover_interval,
                timeout: self.handshake_timeout,
            });
        }
        Ok(())
    }

    pub fn sensor_config(&self, site: Site, name: &str, password: &str) -> SensorConfig {
        let mut config = SensorConfig::new(site, name, password);
        config.binding = self.binding;
        config.announce_interval = self.announce_interval;
        config.handshake_timeout = self.handshake_timeout;
        config
    }

    pub fn viewer_config(&self, site: Site, password: &str) -> ViewerConfig {
        let mut config = ViewerConfig::new(site, password);
        config.binding = self.binding;
        config.discover_interval = self.discover_interval;
        config.handshake_timeout = self.handshake_timeout;
        config
    }
}

impl Default for ArgusConfig {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            announce_interval: Duration::from_secs(30),
            discover_interval: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            binding: SecretBinding::PasswordOnly,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn secs_var(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "ARGUS_REGISTRY_URL",
        "ARGUS_SIGNALING_URL",
        "ARGUS_ICE_SERVERS",
        "ARGUS_ANNOUNCE_INTERVAL_SECS",
        "ARGUS_DISCOVER_INTERVAL_SECS",
        "ARGUS_HANDSHAKE_TIMEOUT_SECS",
        "ARGUS_SECRET_BINDING",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_without_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = ArgusConfig::from_env();
        assert_eq!(config.registry_url, DEFAULT_REGISTRY_URL);
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ice_servers, vec![DEFAULT_ICE_SERVER.to_string()]);
        assert_eq!(config.announce_interval, Duration::from_secs(30));
        assert_eq!(config.discover_interval, Duration::from_secs(20));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_and_bad_values_fall_back() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("ARGUS_REGISTRY_URL", "  registry.example.com ");
            env::set_var("ARGUS_ICE_SERVERS", "stun:a:3478, ,turn:b:3478");
            env::set_var("ARGUS_DISCOVER_INTERVAL_SECS", "45");
            env::set_var("ARGUS_HANDSHAKE_TIMEOUT_SECS", "soon");
            env::set_var("ARGUS_SECRET_BINDING", "site-and-password");
        }
        let config = ArgusConfig::from_env();
        clear_env();

        assert_eq!(config.registry_url, "registry.example.com");
        assert_eq!(config.ice_servers, vec!["stun:a:3478", "turn:b:3478"]);
        assert_eq!(config.discover_interval, Duration::from_secs(45));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.binding, SecretBinding::SiteAndPassword);
    }

    #[test]
    fn discover_interval_is_bounded_by_handshake_timeout() {
        let config = ArgusConfig {
            discover_interval: Duration::from_secs(5),
            ..ArgusConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DiscoverFasterThanHandshake { .. })
        ));

        let config = ArgusConfig {
            announce_interval: Duration::ZERO,
            ..ArgusConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroInterval(_))));
    }

    #[test]
    fn role_configs_inherit_timings() {
        let config = ArgusConfig {
            handshake_timeout: Duration::from_secs(4),
            ..ArgusConfig::default()
        };
        let viewer = config.viewer_config(Site::from("lab"), "pw");
        assert_eq!(viewer.handshake_timeout, Duration::from_secs(4));
        assert_eq!(viewer.discover_interval, Duration::from_secs(20));
        let sensor = config.sensor_config(Site::from("lab"), "Cam1", "pw");
        assert_eq!(sensor.announce_interval, Duration::from_secs(30));
        assert_eq!(sensor.name, "Cam1");
    }
}
