// ABOUTME: Concurrency-safe directory of running tunnels keyed by identity.
// ABOUTME: Creation and removal are exclusive; stats reads run concurrently.

use super::config::TunnelConfig;
use super::error::{Error, Result};
use super::forward::Tunnel;
use super::state::{StopReport, TunnelStats};
use crate::ssh::SessionConfig;
use crate::types::TunnelId;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registered tunnels. Only started tunnels are ever visible.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<TunnelId, Arc<Tunnel>>>,
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry").finish_non_exhaustive()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an SSH session per `session` and start a tunnel over it.
    pub async fn create_tunnel(
        &self,
        id: impl Into<TunnelId>,
        session: SessionConfig,
        config: TunnelConfig,
    ) -> Result<Arc<Tunnel>> {
        self.start_tunnel(Tunnel::over_ssh(id, session, config)).await
    }

    /// Start `tunnel` and register it under its id.
    ///
    /// The write lock is held while starting, so two creations of the same
    /// id serialize and exactly one succeeds. A tunnel that fails to start
    /// is never registered.
    pub async fn start_tunnel(&self, tunnel: Tunnel) -> Result<Arc<Tunnel>> {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(tunnel.id()) {
            return Err(Error::DuplicateId(tunnel.id().clone()));
        }

        tunnel.start().await?;

        let tunnel = Arc::new(tunnel);
        tunnels.insert(tunnel.id().clone(), Arc::clone(&tunnel));
        Ok(tunnel)
    }

    /// The live tunnel registered under `id`.
    pub async fn get(&self, id: &str) -> Result<Arc<Tunnel>> {
        self.tunnels
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(TunnelId::new(id)))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tunnels.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }

    /// Remove the tunnel from the registry, then stop it.
    ///
    /// The id is free for reuse as soon as this call begins stopping.
    pub async fn stop_tunnel(&self, id: &str) -> Result<StopReport> {
        let tunnel = self
            .tunnels
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(TunnelId::new(id)))?;
        tunnel.stop().await
    }

    /// Stats for every registered tunnel, ordered by id.
    pub async fn list(&self) -> BTreeMap<TunnelId, TunnelStats> {
        self.tunnels
            .read()
            .await
            .iter()
            .map(|(id, tunnel)| (id.clone(), tunnel.stats()))
            .collect()
    }

    /// Stop every tunnel and clear the registry.
    ///
    /// All tunnels are stopped even if some fail; failures are aggregated.
    pub async fn stop_all(&self) -> Result<()> {
        let drained: Vec<_> = self.tunnels.write().await.drain().collect();
        if drained.is_empty() {
            return Ok(());
        }
        tracing::info!("Stopping {} tunnel(s)", drained.len());

        let results = join_all(
            drained
                .into_iter()
                .map(|(id, tunnel)| async move { (id, tunnel.stop().await) }),
        )
        .await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for (id, e) in &failures {
                tracing::warn!(tunnel = %id, "Failed to stop tunnel: {}", e);
            }
            Err(Error::StopAll { failures })
        }
    }
}
