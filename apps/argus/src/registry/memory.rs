use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use super::{Registry, RegistryError};
use crate::model::{PeerId, Site};

/// In-process registry keyed by site. Records never expire; callers remove
/// peers explicitly.
#[derive(Default)]
pub struct MemoryRegistry {
    sites: RwLock<HashMap<Site, Vec<(PeerId, Instant)>>>,
    unreachable: AtomicBool,
    announces: AtomicUsize,
    discoveries: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `InvalidResponse`, standing in for an outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn remove(&self, site: &Site, peer_id: &PeerId) {
        if let Some(peers) = self.sites.write().get_mut(site) {
            peers.retain(|(id, _)| id != peer_id);
        }
    }

    pub fn announce_count(&self) -> usize {
        self.announces.load(Ordering::SeqCst)
    }

    pub fn discover_count(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), RegistryError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RegistryError::InvalidResponse("registry offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn announce(&self, site: &Site, peer_id: &PeerId) -> Result<(), RegistryError> {
        self.announces.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let mut sites = self.sites.write();
        let peers = sites.entry(site.clone()).or_default();
        match peers.iter_mut().find(|(id, _)| id == peer_id) {
            Some(entry) => entry.1 = Instant::now(),
            None => peers.push((peer_id.clone(), Instant::now())),
        }
        Ok(())
    }

    async fn discover(&self, site: &Site) -> Result<Vec<PeerId>, RegistryError> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self
            .sites
            .read()
            .get(site)
            .map(|peers| peers.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }
}
