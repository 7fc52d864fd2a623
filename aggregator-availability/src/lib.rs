//! Availability reconciliation for aggregated Kubernetes API services
//!
//! An aggregated apiserver delegates whole API group/versions to services
//! running elsewhere in the cluster. This crate contains the control loop
//! that continuously determines whether each registered APIService is
//! actually reachable, and maintains its `Available` status condition:
//!
//! - [`AvailabilityController`] watches APIServices and their backing
//!   services, probes the remote discovery endpoints with redundant
//!   concurrent requests, and writes status conditions back idempotently.
//! - [`ExternalNameResolver`](resolver::ExternalNameResolver) maps a backing
//!   service reference to a reachable URL.
//! - [`Metrics`] exposes per-APIService availability to a Prometheus
//!   registry.
//! - [`BootGate`] gates a readiness endpoint until every expected APIService
//!   has completed one successful availability pass.
//!
//! The controller composes from informer-backed [`Store`]s and reflected
//! watch streams, the way `kube` controllers normally do:
//!
//! ```no_run
//! use aggregator_availability::{AvailabilityController, Config, Metrics};
//! use aggregator_availability::probe::{ClientIdentity, HttpDiscovery};
//! use aggregator_availability::resolver::ExternalNameResolver;
//! use futures::StreamExt;
//! use k8s_openapi::api::core::v1::Service;
//! use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
//! use kube::{
//!     api::Api,
//!     runtime::{reflector, reflector::store, watcher, WatchStreamExt},
//!     Client,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::try_default().await?;
//! let apiservices: Api<APIService> = Api::all(client.clone());
//! let services: Api<Service> = Api::all(client);
//!
//! let (apiservice_store, apiservice_writer) = store();
//! let apiservice_events = reflector(
//!     apiservice_writer,
//!     watcher(apiservices.clone(), watcher::Config::default()),
//! )
//! .default_backoff()
//! .filter_map(|event| async { event.ok() });
//!
//! let (service_store, service_writer) = store();
//! let service_events = reflector(
//!     service_writer,
//!     watcher(services, watcher::Config::default()),
//! )
//! .default_backoff()
//! .filter_map(|event| async { event.ok() });
//!
//! let metrics = Arc::new(Metrics::new()?);
//! metrics.register(prometheus::default_registry())?;
//!
//! let controller = AvailabilityController::new(
//!     apiservice_store,
//!     service_store.clone(),
//!     apiservices,
//!     ExternalNameResolver::new(service_store),
//!     HttpDiscovery::new(Duration::from_secs(5)),
//!     Arc::new(|| None::<ClientIdentity>),
//!     metrics,
//!     Config::default(),
//! );
//! controller
//!     .run(5, apiservice_events, service_events, futures::future::pending())
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod apiservice;
pub mod controller;
pub mod health;
pub mod index;
pub mod metrics;
pub mod probe;
pub mod queue;
pub mod resolver;

pub use controller::{AvailabilityController, Config};
pub use health::BootGate;
pub use kube::runtime::reflector::Store;
pub use metrics::Metrics;
