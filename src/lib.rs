#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes Service CIDR discovery for cluster networking agents.
//!
//! Cluster networking agents often need to classify traffic destined for
//! Services without enumerating every individual cluster IP. This crate
//! watches Kubernetes `Service` resources and continuously tracks, per IP
//! family, the smallest CIDR block covering every cluster IP seen so far.
//! The block only ever grows, so rules installed from it stay valid as
//! Services come and go.
//!
//! # Features
//!
//! - **Kubernetes API discovery**: Real-time Service updates via watch
//! - **Per-family tracking**: IPv4 and IPv6 CIDRs maintained independently
//! - **Change notification**: Ordered event handlers invoked whenever a
//!   covering CIDR grows, plus a synchronous query surface
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use k8s_service_cidr::{IpFamily, ServiceCache, ServiceCidrDiscoverer, discover};
//!
//! // The cache doubles as the discoverer's address resolver.
//! let cache = Arc::new(ServiceCache::default());
//! let discoverer = Arc::new(ServiceCidrDiscoverer::new(cache.clone()));
//!
//! // Register handlers before starting for deterministic first delivery.
//! discoverer.add_event_handler(|updates| {
//!     for update in updates {
//!         println!("{} Service CIDR grew to {}", update.family, update.cidr);
//!     }
//! });
//!
//! // Start the watch and the processing worker.
//! discover(discoverer.clone(), cache);
//! let (stop, shutdown) = tokio::sync::oneshot::channel();
//! tokio::spawn({
//!     let discoverer = discoverer.clone();
//!     async move { discoverer.run(shutdown).await }
//! });
//!
//! // Query at any time; fails until the first address of that family.
//! match discoverer.get_service_cidr(IpFamily::V4) {
//!     Ok(cidr) => println!("current IPv4 Service CIDR: {cidr}"),
//!     Err(e) => println!("{e}"),
//! }
//! ```

mod cidr;
mod discoverer;
mod k8s;

pub use cidr::{CidrBlock, CidrTracker, IpFamily};
pub use discoverer::{
    CidrEventHandler, CidrUpdate, Error, ServiceCidrDiscoverer, ServiceIpResolver, ServiceKey,
};
pub use k8s::{ClusterIp, ServiceCache, discover};
