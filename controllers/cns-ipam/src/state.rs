//! The IPAM HTTP service's authoritative in-memory state: the allocation
//! map, the orchestrator-context index, and the set of known network
//! containers. All state transitions happen under one mutex (spec §5).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::IpamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpConfigState {
    Available,
    Assigned,
    PendingRelease,
    PendingProgramming,
}

#[derive(Debug, Clone)]
pub struct IpConfiguration {
    pub ip: String,
    pub nc_id: String,
    pub state: IpConfigState,
    pub owning_context: Option<String>,
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NetworkContainer {
    pub id: String,
    pub primary_ip: String,
    pub subnet_name: String,
    pub subnet_prefix_length: u8,
    pub default_gateway: String,
    pub dns_servers: Vec<String>,
    pub version: i64,
    pub published: bool,
}

#[derive(Default)]
struct AllocationState {
    ip_configs: HashMap<String, IpConfiguration>,
    context_to_ipconfig: HashMap<String, String>,
    network_containers: HashMap<String, NetworkContainer>,
}

/// Guards every state transition behind a single mutex, per spec §5 "Shared
/// state".
#[derive(Default)]
pub struct AllocationMap {
    state: Mutex<AllocationState>,
}

impl AllocationMap {
    pub async fn upsert_network_container(&self, nc: NetworkContainer, secondary_ips: Vec<String>) {
        let mut state = self.state.lock().await;
        for ip in secondary_ips {
            state.ip_configs.entry(ip.clone()).or_insert_with(|| IpConfiguration {
                ip,
                nc_id: nc.id.clone(),
                state: IpConfigState::Available,
                owning_context: None,
                last_transition: now(),
            });
        }
        state.network_containers.insert(nc.id.clone(), nc);
    }

    pub async fn delete_network_container(&self, nc_id: &str) {
        let mut state = self.state.lock().await;
        state.network_containers.remove(nc_id);
        state.ip_configs.retain(|_, cfg| cfg.nc_id != nc_id);
    }

    pub async fn publish(&self, nc_id: &str) -> Result<(), IpamError> {
        let mut state = self.state.lock().await;
        let nc = state
            .network_containers
            .get_mut(nc_id)
            .ok_or_else(|| IpamError::UnknownNetworkContainer(nc_id.to_string()))?;
        nc.published = true;
        Ok(())
    }

    pub async fn unpublish(&self, nc_id: &str) -> Result<(), IpamError> {
        let mut state = self.state.lock().await;
        let nc = state
            .network_containers
            .get_mut(nc_id)
            .ok_or_else(|| IpamError::UnknownNetworkContainer(nc_id.to_string()))?;
        nc.published = false;
        Ok(())
    }

    /// `available -> assigned`. A single orchestrator context maps to at
    /// most one assigned IP; re-requesting the same context returns the
    /// existing assignment rather than allocating a second IP.
    pub async fn assign(&self, context: &str, desired_ip: Option<&str>) -> Result<(IpConfiguration, NetworkContainer), IpamError> {
        let mut state = self.state.lock().await;

        if let Some(existing_ip) = state.context_to_ipconfig.get(context).cloned() {
            let cfg = state.ip_configs.get(&existing_ip).cloned().ok_or_else(|| IpamError::NotFound(existing_ip.clone()))?;
            let nc = state.network_containers.get(&cfg.nc_id).cloned().ok_or_else(|| IpamError::UnknownNetworkContainer(cfg.nc_id.clone()))?;
            return Ok((cfg, nc));
        }

        let candidate_ip = match desired_ip {
            Some(ip) => {
                let cfg = state.ip_configs.get(ip).ok_or_else(|| IpamError::NotFound(ip.to_string()))?;
                if cfg.state != IpConfigState::Available {
                    return Err(IpamError::AlreadyAssigned(ip.to_string()));
                }
                ip.to_string()
            }
            None => state
                .ip_configs
                .values()
                .find(|cfg| cfg.state == IpConfigState::Available)
                .map(|cfg| cfg.ip.clone())
                .ok_or(IpamError::PoolExhausted)?,
        };

        let cfg = state.ip_configs.get_mut(&candidate_ip).expect("candidate was just looked up");
        cfg.state = IpConfigState::Assigned;
        cfg.owning_context = Some(context.to_string());
        cfg.last_transition = now();
        let cfg = cfg.clone();
        state.context_to_ipconfig.insert(context.to_string(), candidate_ip);
        let nc = state
            .network_containers
            .get(&cfg.nc_id)
            .cloned()
            .ok_or_else(|| IpamError::UnknownNetworkContainer(cfg.nc_id.clone()))?;
        Ok((cfg, nc))
    }

    /// `assigned -> available`. Releasing a context with no assignment, or
    /// an assignment that was already released, is success (idempotent per
    /// spec §4.8 invariant "a release may arrive before the assign").
    pub async fn release(&self, context: &str) -> Result<(), IpamError> {
        let mut state = self.state.lock().await;
        let Some(ip) = state.context_to_ipconfig.remove(context) else {
            return Ok(());
        };
        if let Some(cfg) = state.ip_configs.get_mut(&ip) {
            cfg.state = IpConfigState::Available;
            cfg.owning_context = None;
            cfg.last_transition = now();
        }
        Ok(())
    }

    /// `available -> pending-release`, used by the pool monitor when
    /// shrinking. Returns the ids actually moved (fewer than requested if
    /// the pool doesn't have that many available).
    pub async fn mark_pending_release(&self, count: usize) -> Vec<String> {
        let mut state = self.state.lock().await;
        let candidates: Vec<String> = state
            .ip_configs
            .values()
            .filter(|cfg| cfg.state == IpConfigState::Available)
            .take(count)
            .map(|cfg| cfg.ip.clone())
            .collect();
        for ip in &candidates {
            if let Some(cfg) = state.ip_configs.get_mut(ip) {
                cfg.state = IpConfigState::PendingRelease;
                cfg.last_transition = now();
            }
        }
        candidates
    }

    /// `pending-release -> available`, the pool monitor's cancel path for
    /// sudden demand.
    pub async fn cancel_pending_release(&self, ips: &[String]) {
        let mut state = self.state.lock().await;
        for ip in ips {
            if let Some(cfg) = state.ip_configs.get_mut(ip) {
                if cfg.state == IpConfigState::PendingRelease {
                    cfg.state = IpConfigState::Available;
                    cfg.last_transition = now();
                }
            }
        }
    }

    /// `pending-release -> (removed)`, once the upstream allocator confirms.
    pub async fn confirm_released(&self, ips: &[String]) {
        let mut state = self.state.lock().await;
        for ip in ips {
            state.ip_configs.remove(ip);
        }
    }

    pub async fn counts(&self) -> PoolCounts {
        let state = self.state.lock().await;
        let mut counts = PoolCounts::default();
        for cfg in state.ip_configs.values() {
            match cfg.state {
                IpConfigState::Available => counts.available += 1,
                IpConfigState::Assigned => counts.assigned += 1,
                IpConfigState::PendingRelease => counts.pending_release += 1,
                IpConfigState::PendingProgramming => counts.pending_programming += 1,
            }
        }
        counts
    }

    pub async fn debug_ip_addresses(&self) -> Vec<IpConfiguration> {
        self.state.lock().await.ip_configs.values().cloned().collect()
    }

    pub async fn debug_pod_context(&self) -> HashMap<String, String> {
        self.state.lock().await.context_to_ipconfig.clone()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolCounts {
    pub available: u32,
    pub assigned: u32,
    pub pending_release: u32,
    pub pending_programming: u32,
}

fn now() -> DateTime<Utc> {
    // Transition timestamps are advisory (diagnostics only); a fixed epoch
    // placeholder would defeat their purpose, so this is the one place the
    // wall clock is read directly rather than threaded through as an input.
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nc(id: &str) -> NetworkContainer {
        NetworkContainer {
            id: id.to_string(),
            primary_ip: "10.0.0.4".to_string(),
            subnet_name: "subnet1".to_string(),
            subnet_prefix_length: 24,
            default_gateway: "10.0.0.1".to_string(),
            dns_servers: vec!["168.63.129.16".to_string()],
            version: 1,
            published: true,
        }
    }

    #[tokio::test]
    async fn assign_then_release_round_trips_to_available() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string()]).await;

        let (cfg, _) = map.assign("pod-a", None).await.unwrap();
        assert_eq!(cfg.ip, "10.0.0.5");
        assert_eq!(map.counts().await.assigned, 1);

        map.release("pod-a").await.unwrap();
        let counts = map.counts().await;
        assert_eq!(counts.assigned, 0);
        assert_eq!(counts.available, 1);
    }

    #[tokio::test]
    async fn repeated_assign_for_same_context_returns_existing_ip() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]).await;

        let (first, _) = map.assign("pod-a", None).await.unwrap();
        let (second, _) = map.assign("pod-a", None).await.unwrap();
        assert_eq!(first.ip, second.ip);
        assert_eq!(map.counts().await.assigned, 1);
    }

    #[tokio::test]
    async fn release_with_no_prior_assign_is_a_noop_success() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string()]).await;
        map.release("never-assigned").await.unwrap();
        assert_eq!(map.counts().await.available, 1);
    }

    #[tokio::test]
    async fn desired_ip_already_assigned_is_distinct_from_pool_exhaustion() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string()]).await;
        map.assign("pod-a", None).await.unwrap();
        let err = map.assign("pod-b", Some("10.0.0.5")).await.unwrap_err();
        assert!(matches!(err, IpamError::AlreadyAssigned(ip) if ip == "10.0.0.5"));
    }

    #[tokio::test]
    async fn pool_exhausted_when_no_available_ip_remains() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string()]).await;
        map.assign("pod-a", None).await.unwrap();
        let err = map.assign("pod-b", None).await.unwrap_err();
        assert!(matches!(err, IpamError::PoolExhausted));
    }

    #[tokio::test]
    async fn mark_pending_release_then_cancel_restores_availability() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]).await;

        let moved = map.mark_pending_release(1).await;
        assert_eq!(moved.len(), 1);
        assert_eq!(map.counts().await.pending_release, 1);

        map.cancel_pending_release(&moved).await;
        let counts = map.counts().await;
        assert_eq!(counts.pending_release, 0);
        assert_eq!(counts.available, 2);
    }

    #[tokio::test]
    async fn confirm_released_removes_ip_from_the_pool_entirely() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string()]).await;
        let moved = map.mark_pending_release(1).await;
        map.confirm_released(&moved).await;
        let counts = map.counts().await;
        assert_eq!(counts.available + counts.assigned + counts.pending_release + counts.pending_programming, 0);
    }

    #[tokio::test]
    async fn delete_network_container_removes_its_ip_configs() {
        let map = AllocationMap::default();
        map.upsert_network_container(nc("nc1"), vec!["10.0.0.5".to_string()]).await;
        map.delete_network_container("nc1").await;
        assert_eq!(map.counts().await.available, 0);
    }
}
