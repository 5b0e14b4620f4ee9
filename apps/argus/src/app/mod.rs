pub mod cli;
pub mod error;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::auth::Argon2Scheme;
use crate::capture::{LoggingSink, SyntheticCapture};
use crate::config::ArgusConfig;
use crate::model::Site;
use crate::registry::{MemoryRegistry, Registry};
use crate::sensor::{Sensor, SensorDeps};
use crate::transport::local::LocalPeerNetwork;
use crate::viewer::{ViewerDeps, ViewerEvent, ViewerSessionManager, attach_renderer};
use cli::{Command, LoopbackArgs, NetworkArgs};
use error::CliError;

pub async fn run(cli: cli::Cli) -> Result<(), CliError> {
    let config = ArgusConfig::from_env();
    match cli.command {
        Command::Sensor(args) => {
            let config = apply_network_overrides(config, &args.network)?;
            sensor::run(config, args).await
        }
        Command::Viewer(args) => {
            let config = apply_network_overrides(config, &args.network)?;
            viewer::run(config, args).await
        }
        Command::Loopback(args) => {
            config.validate()?;
            loopback(config, args).await
        }
    }
}

fn apply_network_overrides(
    mut config: ArgusConfig,
    overrides: &NetworkArgs,
) -> Result<ArgusConfig, CliError> {
    if let Some(url) = overrides.registry_url.as_ref() {
        config.registry_url = url.clone();
    }
    if let Some(url) = overrides.signaling_url.as_ref() {
        config.signaling_url = url.clone();
    }
    if let Some(binding) = overrides.binding {
        config.binding = binding;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "webrtc-provider")]
fn network_stack(
    config: &ArgusConfig,
) -> Result<
    (
        Arc<dyn crate::transport::TransportProvider>,
        Arc<dyn Registry>,
    ),
    CliError,
> {
    use crate::registry::{HttpRegistry, RegistryConfig};
    use crate::transport::webrtc::{WebRtcConfig, WebRtcProvider};

    let registry = HttpRegistry::new(RegistryConfig::new(&config.registry_url)?)?;
    let webrtc = WebRtcConfig::new(&config.signaling_url)?.with_ice_servers(config.ice_servers.clone());
    info!(
        target: "argus::cli",
        registry = %registry.config().base_url(),
        signaling = %webrtc.signaling_url,
        "using network stack"
    );
    Ok((Arc::new(WebRtcProvider::new(webrtc)), Arc::new(registry)))
}

mod sensor {
    use super::*;
    use crate::app::cli::SensorArgs;

    #[cfg(feature = "webrtc-provider")]
    pub(super) async fn run(config: ArgusConfig, args: SensorArgs) -> Result<(), CliError> {
        let (provider, registry) = network_stack(&config)?;
        let deps = SensorDeps {
            provider,
            registry,
            capture: Arc::new(SyntheticCapture::new(args.fps)),
            scheme: Arc::new(Argon2Scheme::default()),
            wake_lock: None,
        };
        let sensor = Sensor::start(
            config.sensor_config(Site::new(args.site), &args.name, &args.password),
            deps,
        )
        .await?;
        eprintln!(
            "sensor '{}' serving site '{}' as {}; press Ctrl-C to stop",
            args.name,
            sensor.site(),
            sensor.local_peer_id()
        );
        tokio::signal::ctrl_c().await?;
        sensor.dispose().await;
        Ok(())
    }

    #[cfg(not(feature = "webrtc-provider"))]
    pub(super) async fn run(_config: ArgusConfig, _args: SensorArgs) -> Result<(), CliError> {
        Err(CliError::Unsupported("sensor"))
    }
}

mod viewer {
    use super::*;
    use crate::app::cli::ViewerArgs;

    #[cfg(feature = "webrtc-provider")]
    pub(super) async fn run(config: ArgusConfig, args: ViewerArgs) -> Result<(), CliError> {
        let (provider, registry) = network_stack(&config)?;
        let deps = ViewerDeps {
            provider,
            registry,
            scheme: Arc::new(Argon2Scheme::default()),
        };
        let handle = ViewerSessionManager::start(
            config.viewer_config(Site::new(args.site), &args.password),
            deps,
        )
        .await?;
        let renderer = attach_renderer(&handle, Arc::new(LoggingSink));
        let mut events = handle.subscribe();
        eprintln!(
            "viewer watching site '{}' as {}; press Ctrl-C to stop",
            handle.site(),
            handle.local_peer_id()
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    result?;
                    break;
                }
                event = events.recv() => match event {
                    Ok(ViewerEvent::SensorConnected(session)) => {
                        eprintln!("connected: {} ({})", session.name(), session.peer_id());
                    }
                    Ok(ViewerEvent::SensorDisconnected { peer_id, name }) => {
                        eprintln!("disconnected: {name} ({peer_id})");
                    }
                    Ok(ViewerEvent::AttemptFailed { peer_id, outcome }) => {
                        info!(target: "argus::cli", peer_id = %peer_id, outcome = %outcome, "attempt failed");
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
        handle.dispose().await;
        let _ = renderer.await;
        Ok(())
    }

    #[cfg(not(feature = "webrtc-provider"))]
    pub(super) async fn run(_config: ArgusConfig, _args: ViewerArgs) -> Result<(), CliError> {
        Err(CliError::Unsupported("viewer"))
    }
}

/// Sensor and viewer over the in-memory transport and registry. Prints the
/// first connected sensor's name on stdout.
async fn loopback(config: ArgusConfig, args: LoopbackArgs) -> Result<(), CliError> {
    let network = LocalPeerNetwork::new();
    let registry = Arc::new(MemoryRegistry::new());
    let scheme = Arc::new(Argon2Scheme::default());
    let site = Site::new(args.site);

    let sensor = Sensor::start(
        config.sensor_config(site.clone(), &args.name, &args.password),
        SensorDeps {
            provider: Arc::new(network.clone()),
            registry: registry.clone(),
            capture: Arc::new(SyntheticCapture::default()),
            scheme: scheme.clone(),
            wake_lock: None,
        },
    )
    .await?;

    let viewer = ViewerSessionManager::start(
        config.viewer_config(site.clone(), &args.password),
        ViewerDeps {
            provider: Arc::new(network),
            registry: registry.clone(),
            scheme,
        },
    )
    .await?;
    let mut events = viewer.subscribe();

    let wait = Duration::from_secs(args.wait_secs);
    let connected = tokio::time::timeout(wait, async {
        loop {
            if registry.discover(&site).await.is_ok_and(|peers| !peers.is_empty()) {
                viewer.refresh();
            }
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ViewerEvent::SensorConnected(session)) => return Some(session),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                },
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    })
    .await
    .ok()
    .flatten();

    viewer.dispose().await;
    sensor.dispose().await;

    match connected {
        Some(session) => {
            println!("{}", session.name());
            Ok(())
        }
        None => {
            warn!(target: "argus::cli", "loopback sensor never connected");
            Err(CliError::NoSensor(args.wait_secs))
        }
    }
}
