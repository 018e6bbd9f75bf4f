//! Kubernetes Service watch adapter.
//!
//! This module feeds the [`ServiceCidrDiscoverer`] from a cluster-wide
//! `Service` watch. Watch events update a local [`ServiceCache`] and
//! enqueue the affected Service key; the discoverer later resolves the
//! key against the cache, so it always sees the newest state of a
//! Service no matter how many events for it were coalesced.
//!
//! # How It Works
//!
//! 1. Watches `Service` resources across all namespaces
//! 2. Extracts cluster IPs from each event, skipping headless Services
//!    and malformed addresses
//! 3. Stores the extracted addresses in the cache and enqueues the key
//! 4. The discoverer's worker drains the queue and grows the per-family
//!    covering CIDRs
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use k8s_service_cidr::{IpFamily, ServiceCache, ServiceCidrDiscoverer, discover};
//!
//! let cache = Arc::new(ServiceCache::default());
//! let discoverer = Arc::new(ServiceCidrDiscoverer::new(cache.clone()));
//!
//! discoverer.add_event_handler(|updates| {
//!     for update in updates {
//!         println!("{} Service CIDR is now {}", update.family, update.cidr);
//!     }
//! });
//!
//! discover(discoverer.clone(), cache);
//!
//! let (stop, shutdown) = tokio::sync::oneshot::channel();
//! tokio::spawn(async move { discoverer.run(shutdown).await });
//! // ... later: stop.send(()).ok();
//! ```

use std::collections::HashMap;
use std::net::{AddrParseError, IpAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client};

use crate::discoverer::{ServiceCidrDiscoverer, ServiceIpResolver, ServiceKey};

/// Error type for watch failures.
type Error = Box<dyn std::error::Error + Send + Sync>;

/// Result type for watch operations.
type Result<T> = std::result::Result<T, Error>;

/// A Service's declared cluster IP entry.
///
/// Kubernetes represents a headless Service with the literal string
/// `"None"` in the `clusterIPs` field (and an empty string before
/// allocation); this enum replaces that sentinel with an explicit
/// variant so callers never compare raw strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterIp {
    /// No cluster-internal address: headless or not yet allocated.
    Headless,
    /// A concrete cluster-internal address.
    Concrete(IpAddr),
}

impl FromStr for ClusterIp {
    type Err = AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() || s == "None" {
            return Ok(Self::Headless);
        }
        s.parse().map(Self::Concrete)
    }
}

/// Local store of each known Service's current cluster IPs.
///
/// Kept up to date by the watch loop and read back by the discoverer at
/// processing time. Evicted or unknown keys resolve to no addresses,
/// which the discoverer treats as a no-op.
#[derive(Default)]
pub struct ServiceCache {
    entries: Mutex<HashMap<ServiceKey, Vec<IpAddr>>>,
}

impl ServiceCache {
    fn apply(&self, key: ServiceKey, ips: Vec<IpAddr>) {
        self.lock_entries().insert(key, ips);
    }

    fn evict(&self, key: &ServiceKey) {
        self.lock_entries().remove(key);
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<ServiceKey, Vec<IpAddr>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceIpResolver for ServiceCache {
    fn resolve(&self, key: &ServiceKey) -> Vec<IpAddr> {
        self.lock_entries().get(key).cloned().unwrap_or_default()
    }
}

/// Starts watching Kubernetes Services and feeding the discoverer.
///
/// This function spawns a background task that watches `Service`
/// resources across all namespaces, maintains `cache`, and enqueues
/// changed Service keys on `discoverer`. Pass the same cache the
/// discoverer was constructed with.
///
/// # Requirements
///
/// - The application must have RBAC permissions to watch `Service`
///   resources cluster-wide
/// - Kubernetes client configuration (in-cluster or kubeconfig)
pub fn discover(discoverer: Arc<ServiceCidrDiscoverer>, cache: Arc<ServiceCache>) {
    tokio::spawn(async move {
        if let Err(e) = watch_loop(&discoverer, &cache).await {
            tracing::error!("Kubernetes Service watcher failed: {e}");
        }
    });
}

/// Background task that watches `Service` resources and enqueues keys.
async fn watch_loop(discoverer: &ServiceCidrDiscoverer, cache: &ServiceCache) -> Result<()> {
    let client = Client::try_default().await?;
    let services: Api<Service> = Api::all(client);

    let stream = watcher::watcher(services, WatcherConfig::default()).default_backoff();
    tokio::pin!(stream);

    tracing::debug!("Starting Kubernetes Service watch for CIDR discovery");

    while let Some(event) = stream.try_next().await? {
        for key in process_event(&event, cache) {
            discoverer.enqueue(key);
        }
    }

    Ok(())
}

/// Processes a watcher event and returns the Service keys to reprocess.
///
/// This function is extracted to enable unit testing of the event
/// processing logic.
fn process_event(event: &Event<Service>, cache: &ServiceCache) -> Vec<ServiceKey> {
    match event {
        Event::Apply(service) | Event::InitApply(service) => {
            let Some(key) = service_key(service) else {
                return Vec::new();
            };

            let ips = cluster_ips(service);
            tracing::debug!("Service {key} updated: {} cluster IP(s)", ips.len());
            cache.apply(key.clone(), ips);
            vec![key]
        }

        Event::Delete(service) => {
            let Some(key) = service_key(service) else {
                return Vec::new();
            };

            tracing::debug!("Service {key} deleted");
            cache.evict(&key);
            vec![key]
        }

        Event::Init | Event::InitDone => {
            tracing::debug!("Kubernetes watcher initialization event");
            Vec::new()
        }
    }
}

/// Builds the processing key for a Service, if it is properly named.
fn service_key(service: &Service) -> Option<ServiceKey> {
    let name = service.metadata.name.as_ref()?;
    let namespace = service.metadata.namespace.as_deref().unwrap_or_default();
    Some(ServiceKey::new(namespace, name))
}

/// Extracts the concrete cluster IPs declared by a Service.
///
/// Reads every entry of `spec.clusterIPs`, falling back to the singular
/// `spec.clusterIP` field for objects written by older API servers.
/// Headless sentinels contribute nothing; entries that parse as neither
/// a sentinel nor an address are skipped with a warning.
fn cluster_ips(service: &Service) -> Vec<IpAddr> {
    let Some(spec) = &service.spec else {
        return Vec::new();
    };

    let declared: &[String] = match &spec.cluster_ips {
        Some(ips) if !ips.is_empty() => ips,
        _ => spec
            .cluster_ip
            .as_ref()
            .map(std::slice::from_ref)
            .unwrap_or_default(),
    };

    let mut ips = Vec::new();
    for raw in declared {
        match raw.parse::<ClusterIp>() {
            Ok(ClusterIp::Concrete(ip)) => ips.push(ip),
            Ok(ClusterIp::Headless) => {}
            Err(e) => {
                tracing::warn!("skipping malformed cluster IP {raw:?}: {e}");
            }
        }
    }

    ips
}
