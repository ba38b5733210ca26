//! Tenant directory client: resolves tenants to live pod addresses.
//!
//! Wraps the gRPC tenant-directory service with a per-tenant cache of
//! cluster name and pod addresses. A background task consumes the pod
//! watch stream, keeps the cache fresh, and forwards each event into an
//! optional channel owned by the handler subsystem (which uses it to arm
//! the idle monitor). Lost watch updates are tolerated because every
//! resolve re-validates against the cache or the service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gatehouse_common::proto::tenant_directory_client::TenantDirectoryClient;
use gatehouse_common::proto::{
    EnsurePodRequest, GetTenantRequest, ListPodsRequest, Pod, PodState, ReportFailureRequest,
    WatchPodsRequest,
};
use gatehouse_common::GatehouseError;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, warn};

use crate::routing::TenantId;

#[derive(Debug, Clone)]
struct DirectoryEntry {
    cluster_name: String,
    addrs: Vec<String>,
}

/// Client of the tenant directory service.
pub struct Directory {
    client: TenantDirectoryClient<Channel>,
    cache: Mutex<HashMap<u64, DirectoryEntry>>,
}

impl Directory {
    /// Connects lazily to the directory at `addr` and starts the pod
    /// watcher. Pod events are forwarded into `pod_watcher` when given.
    pub fn new(
        addr: &str,
        pod_watcher: Option<mpsc::Sender<Pod>>,
        quiesce: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, GatehouseError> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let endpoint = Channel::from_shared(uri).map_err(|e| {
            GatehouseError::ConfigError(format!("invalid directory address '{}': {}", addr, e))
        })?;
        let channel = endpoint.connect_lazy();

        let directory = Arc::new(Self {
            client: TenantDirectoryClient::new(channel),
            cache: Mutex::new(HashMap::new()),
        });

        let watcher = Arc::clone(&directory);
        tokio::spawn(async move {
            watcher.watch_pods(pod_watcher, quiesce).await;
        });

        Ok(directory)
    }

    /// Resolve a tenant to the address of a live pod. The cache is
    /// consulted first; a miss fetches synchronously. A cluster name that
    /// does not match the directory's record is reported as not-found
    /// rather than leaking the real name.
    pub async fn ensure_tenant_addr(
        &self,
        tenant_id: TenantId,
        cluster_name: &str,
    ) -> Result<String, Status> {
        let mut entry = match self.cached_entry(tenant_id) {
            Some(entry) => entry,
            None => self.fetch_entry(tenant_id).await?,
        };

        if !cluster_name.is_empty() && entry.cluster_name != cluster_name {
            return Err(Status::not_found(format!(
                "cluster {}-{} not found",
                cluster_name, tenant_id
            )));
        }

        if entry.addrs.is_empty() {
            // Ask the directory to bring up a pod, then refresh.
            let mut client = self.client.clone();
            client
                .ensure_pod(EnsurePodRequest {
                    tenant_id: tenant_id.get(),
                })
                .await?;
            entry = self.fetch_entry(tenant_id).await?;
        }

        entry
            .addrs
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                Status::unavailable(format!("no pods available for tenant {}", tenant_id))
            })
    }

    /// Tell the directory that `addr` failed so it can evict stale state.
    /// The address is dropped from the local cache immediately.
    pub async fn report_failure(&self, tenant_id: TenantId, addr: &str) -> Result<(), Status> {
        let mut client = self.client.clone();
        client
            .report_failure(ReportFailureRequest {
                tenant_id: tenant_id.get(),
                addr: addr.to_string(),
            })
            .await?;

        let mut cache = self.cache.lock().unwrap();
        if let Some(entry) = cache.get_mut(&tenant_id.get()) {
            entry.addrs.retain(|a| a != addr);
        }
        Ok(())
    }

    fn cached_entry(&self, tenant_id: TenantId) -> Option<DirectoryEntry> {
        self.cache.lock().unwrap().get(&tenant_id.get()).cloned()
    }

    async fn fetch_entry(&self, tenant_id: TenantId) -> Result<DirectoryEntry, Status> {
        let mut client = self.client.clone();
        let tenant = client
            .get_tenant(GetTenantRequest {
                tenant_id: tenant_id.get(),
            })
            .await?
            .into_inner();
        let pods = client
            .list_pods(ListPodsRequest {
                tenant_id: tenant_id.get(),
            })
            .await?
            .into_inner();

        let addrs = pods
            .pods
            .into_iter()
            .filter(|pod| pod.state() == PodState::Running)
            .map(|pod| pod.addr)
            .collect();
        let entry = DirectoryEntry {
            cluster_name: tenant.cluster_name,
            addrs,
        };
        self.cache
            .lock()
            .unwrap()
            .insert(tenant_id.get(), entry.clone());
        Ok(entry)
    }

    /// Long-lived consumer of the pod watch stream. Reconnects with a
    /// capped backoff; ends on quiesce.
    async fn watch_pods(
        self: Arc<Self>,
        forward: Option<mpsc::Sender<Pod>>,
        mut quiesce: watch::Receiver<bool>,
    ) {
        const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
        const MAX_BACKOFF: Duration = Duration::from_secs(10);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut client = self.client.clone();
            let connect = tokio::select! {
                result = client.watch_pods(WatchPodsRequest {}) => result,
                _ = quiesce.changed() => return,
            };

            match connect {
                Ok(response) => {
                    backoff = INITIAL_BACKOFF;
                    let mut stream = response.into_inner();
                    loop {
                        let message = tokio::select! {
                            message = stream.message() => message,
                            _ = quiesce.changed() => return,
                        };
                        match message {
                            Ok(Some(update)) => {
                                let Some(pod) = update.pod else { continue };
                                self.apply_pod_update(&pod);
                                if let Some(tx) = &forward {
                                    let _ = tx.send(pod).await;
                                }
                            }
                            Ok(None) => {
                                debug!("pod watch stream closed by the directory");
                                break;
                            }
                            Err(status) => {
                                debug!("pod watch stream error: {}", status);
                                break;
                            }
                        }
                    }
                }
                Err(status) => {
                    warn!("pod watch connect failed: {}", status);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = quiesce.changed() => return,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn apply_pod_update(&self, pod: &Pod) {
        let mut cache = self.cache.lock().unwrap();
        let Some(entry) = cache.get_mut(&pod.tenant_id) else {
            // Tenants nobody asked about are not cached.
            return;
        };
        match pod.state() {
            PodState::Running => {
                if !entry.addrs.iter().any(|a| a == &pod.addr) {
                    entry.addrs.push(pod.addr.clone());
                }
            }
            _ => entry.addrs.retain(|a| a != &pod.addr),
        }
    }
}
