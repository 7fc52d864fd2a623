//! Boot-sequence readiness gate
//!
//! Gates a readiness endpoint on every expected APIService having completed
//! at least one successful availability pass. The gate is fed from the same
//! APIService watch stream the controller consumes; it only ever shrinks its
//! pending set, so a service that later turns unavailable again does not
//! un-ready the process.

use std::collections::BTreeSet;

use futures::{Stream, StreamExt};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::{runtime::watcher, ResourceExt};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::apiservice;

#[derive(Debug, Error)]
#[error("missing APIServices: {}", .missing.join(", "))]
pub struct MissingApiServices {
    missing: Vec<String>,
}

/// Health predicate that passes once every expected APIService has been
/// observed with `Available == True`.
pub struct BootGate {
    name: String,
    pending: Mutex<BTreeSet<String>>,
}

impl BootGate {
    pub fn new(name: impl Into<String>, expected: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            pending: Mutex::new(expected.into_iter().collect()),
        }
    }

    /// The health check's name, for registration with a health endpoint.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Ok` once the pending set is empty, otherwise an error listing the
    /// still-pending names in sorted order.
    pub fn check(&self) -> Result<(), MissingApiServices> {
        let pending = self.pending.lock();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(MissingApiServices {
                missing: pending.iter().cloned().collect(),
            })
        }
    }

    /// Fold a single observed APIService into the gate.
    pub fn observe(&self, observed: &APIService) {
        if !apiservice::is_available(observed) {
            return;
        }
        let name = observed.name_any();
        let mut pending = self.pending.lock();
        if pending.remove(&name) {
            debug!(%name, "expected APIService became available");
            if pending.is_empty() {
                info!(gate = %self.name, "all expected APIServices are available");
            }
        }
    }

    /// Drive the gate from a watch stream until the stream ends.
    pub async fn watch<S>(&self, events: S)
    where
        S: Stream<Item = watcher::Event<APIService>>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match &event {
                watcher::Event::Apply(observed) | watcher::Event::InitApply(observed) => {
                    self.observe(observed);
                }
                _ => {}
            }
        }
    }
}
