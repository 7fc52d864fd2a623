//! The availability reconciliation control loop
//!
//! Watches APIServices and their backing services, probes the remote
//! discovery endpoints of delegated API groups, and writes the `Available`
//! status condition back. Level-triggered: every relevant watch event and a
//! periodic resync re-enqueue the affected APIServices, and each sync
//! recomputes the condition from scratch.

use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream, FutureExt, Stream, StreamExt};
use k8s_openapi::{
    api::core::v1::Service,
    kube_aggregator::pkg::apis::apiregistration::v1::{APIService, ServiceReference},
};
use kube::{
    api::{Api, PostParams},
    runtime::{
        reflector::{ObjectRef, Store},
        watcher,
    },
    ResourceExt,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    apiservice::{self, conditions},
    index::ServiceIndex,
    metrics::Metrics,
    probe::{self, ClientIdentity, DiscoveryClient, ProbeError},
    queue::WorkQueue,
    resolver::{EndpointResolver, ResolveError},
};

const DEFAULT_PORT: i32 = 443;

#[derive(Debug, Error)]
pub enum Error {
    /// All probe attempts failed. The condition write has already been
    /// attempted by the time this is returned.
    #[error("discovery check for {name} failed")]
    DiscoveryCheckFailed {
        name: String,
        #[source]
        source: ProbeError,
    },
    #[error("failed to update status of {name}")]
    StatusUpdateFailed {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Writes an APIService's status subresource.
///
/// The implementation is expected to enforce optimistic concurrency: a
/// concurrent modification must surface as an error, which the controller
/// treats as retryable.
#[async_trait]
pub trait ApiServiceStatusClient: Send + Sync {
    async fn update_status(&self, apiservice: &APIService) -> Result<APIService, kube::Error>;
}

#[async_trait]
impl ApiServiceStatusClient for Api<APIService> {
    async fn update_status(&self, apiservice: &APIService) -> Result<APIService, kube::Error> {
        let data = serde_json::to_vec(apiservice).map_err(kube::Error::SerdeError)?;
        self.replace_status(&apiservice.name_any(), &PostParams::default(), data)
            .await
    }
}

/// Source of the client certificate presented during discovery probes.
///
/// Polled fresh on every sync so that certificate rotation takes effect
/// without restarting the controller. Auto-implemented for closures.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Option<ClientIdentity>;
}

impl<F> IdentityProvider for F
where
    F: Fn() -> Option<ClientIdentity> + Send + Sync,
{
    fn identity(&self) -> Option<ClientIdentity> {
        (self)()
    }
}

/// Controller tuning knobs. The defaults match production behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period after which every known APIService is re-enqueued.
    pub resync_period: Duration,
    /// Number of concurrent discovery attempts per probe; one success is
    /// enough.
    pub probe_attempts: usize,
    /// Hard deadline per probe attempt, independent of whatever timeout the
    /// discovery client enforces internally.
    pub attempt_deadline: Duration,
    /// Initial requeue delay after a failed sync.
    pub retry_base: Duration,
    /// Requeue delay ceiling.
    pub retry_cap: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(30),
            probe_attempts: 5,
            attempt_deadline: Duration::from_secs(6),
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_secs(30),
        }
    }
}

type ServiceRefKey = (String, String, i32);

fn service_ref_key(reference: &ServiceReference) -> ServiceRefKey {
    (
        reference.namespace.clone().unwrap_or_default(),
        reference.name.clone().unwrap_or_default(),
        reference.port.unwrap_or(DEFAULT_PORT),
    )
}

enum TopologyEvent {
    ApiService(watcher::Event<APIService>),
    Backing(watcher::Event<Service>),
}

/// Dispatcher-task state: the last observed service pointer per APIService,
/// used to rebuild the dependency index only when the pointer actually
/// changes rather than on every update.
#[derive(Default)]
struct Dispatcher {
    service_refs: HashMap<String, Option<ServiceRefKey>>,
}

/// Reconciles the `Available` condition of every registered APIService.
pub struct AvailabilityController<C, R, D> {
    apiservices: Store<APIService>,
    services: Store<Service>,
    status_client: C,
    resolver: R,
    discovery: D,
    identity: Arc<dyn IdentityProvider>,
    metrics: Arc<Metrics>,
    index: Arc<ServiceIndex>,
    queue: Arc<WorkQueue<String>>,
    config: Config,
}

impl<C, R, D> AvailabilityController<C, R, D>
where
    C: ApiServiceStatusClient,
    R: EndpointResolver,
    D: DiscoveryClient,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        apiservices: Store<APIService>,
        services: Store<Service>,
        status_client: C,
        resolver: R,
        discovery: D,
        identity: Arc<dyn IdentityProvider>,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.retry_base, config.retry_cap));
        Self {
            apiservices,
            services,
            status_client,
            resolver,
            discovery,
            identity,
            metrics,
            index: Arc::new(ServiceIndex::new()),
            queue,
            config,
        }
    }

    /// Number of APIServices currently awaiting (re)evaluation.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn rebuild_index(&self) {
        let snapshot = self.apiservices.state();
        self.index.rebuild(snapshot.iter().map(Arc::as_ref));
        debug!(
            generation = self.index.generation(),
            "rebuilt service dependency index"
        );
    }

    fn handle_apiservice_event(&self, state: &mut Dispatcher, event: &watcher::Event<APIService>) {
        match event {
            watcher::Event::Apply(apiservice) | watcher::Event::InitApply(apiservice) => {
                let name = apiservice.name_any();
                let reference = apiservice
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.service.as_ref())
                    .map(service_ref_key);
                let changed = match state.service_refs.get(&name) {
                    Some(previous) => previous != &reference,
                    None => reference.is_some(),
                };
                state.service_refs.insert(name.clone(), reference);
                if changed {
                    self.rebuild_index();
                }
                self.queue.add(name);
            }
            watcher::Event::Delete(apiservice) => {
                let name = apiservice.name_any();
                if state.service_refs.remove(&name).flatten().is_some() {
                    self.rebuild_index();
                }
                self.metrics.forget(&name);
                self.queue.add(name);
            }
            _ => {}
        }
    }

    fn handle_service_event(&self, event: &watcher::Event<Service>) {
        let service = match event {
            watcher::Event::Apply(service)
            | watcher::Event::InitApply(service)
            | watcher::Event::Delete(service) => service,
            _ => return,
        };
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        for dependent in self.index.dependents(&namespace, &name) {
            self.queue.add(dependent);
        }
    }

    /// One reconciliation pass for the APIService named `key`.
    ///
    /// Recomputes the `Available` condition (probing the backing service if
    /// there is one) and writes the status back only if it changed.
    pub async fn sync(&self, key: &str) -> Result<(), Error> {
        let Some(original) = self.apiservices.get(&ObjectRef::new(key)) else {
            // Deleted while queued.
            return Ok(());
        };
        let mut updated = (*original).clone();
        // Re-read so a rotated certificate is picked up without a restart.
        let identity = self.identity.identity();
        let reference = updated
            .spec
            .as_ref()
            .and_then(|spec| spec.service.as_ref())
            .cloned();

        let mut discovery_failure = None;
        let condition = match &reference {
            // Local API groups are served in-process: always available, never
            // probed.
            None => conditions::local(),
            Some(reference) => {
                let (namespace, name, port) = service_ref_key(reference);
                let port = u16::try_from(port).unwrap_or(DEFAULT_PORT as u16);
                match self.resolver.resolve(&namespace, &name, port) {
                    Err(ResolveError::NotFound { .. }) => {
                        conditions::service_not_found(&namespace, &name)
                    }
                    Err(err) => conditions::service_access_error(&err),
                    Ok(base) => {
                        let group = updated
                            .spec
                            .as_ref()
                            .and_then(|spec| spec.group.clone())
                            .unwrap_or_default();
                        let version = updated
                            .spec
                            .as_ref()
                            .and_then(|spec| spec.version.clone())
                            .unwrap_or_default();
                        match probe::discovery_url(&base, &group, &version) {
                            Err(err) => conditions::service_access_error(&err),
                            Ok(url) => {
                                let outcome = probe::check_any(
                                    &self.discovery,
                                    &url,
                                    identity.as_ref(),
                                    self.config.probe_attempts,
                                    self.config.attempt_deadline,
                                )
                                .await;
                                match outcome {
                                    Ok(()) => conditions::passed(),
                                    Err(err) => {
                                        let condition = conditions::failed_discovery_check(&err);
                                        discovery_failure = Some(err);
                                        condition
                                    }
                                }
                            }
                        }
                    }
                }
            }
        };

        apiservice::set_condition(&mut updated, condition);
        self.update_status(&original, &updated).await?;

        match discovery_failure {
            // Even though the status write succeeded, fail the sync so the
            // queue keeps the key hot for fast re-probing instead of waiting
            // out the resync period.
            Some(source) => Err(Error::DiscoveryCheckFailed {
                name: key.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    async fn update_status(&self, original: &APIService, updated: &APIService) -> Result<(), Error> {
        let name = updated.name_any();
        let was_available = apiservice::is_available(original);
        let now_available = apiservice::is_available(updated);
        // The gauge mirrors the outcome of every sync, not just transitions.
        self.metrics.set_available(&name, now_available);

        if original.status == updated.status {
            return Ok(());
        }

        let new = apiservice::get_condition(updated, apiservice::AVAILABLE);
        let old_status = apiservice::get_condition(original, apiservice::AVAILABLE)
            .map_or(apiservice::CONDITION_UNKNOWN, |condition| {
                condition.status.as_str()
            });
        let new_status = new.map_or(apiservice::CONDITION_UNKNOWN, |condition| {
            condition.status.as_str()
        });
        if old_status != new_status {
            info!(
                apiservice = %name,
                old = %old_status,
                new = %new_status,
                reason = new.and_then(|c| c.reason.as_deref()).unwrap_or(""),
                message = new.and_then(|c| c.message.as_deref()).unwrap_or(""),
                "changing APIService availability"
            );
        }

        self.status_client
            .update_status(updated)
            .await
            .map_err(|source| Error::StatusUpdateFailed {
                name: name.clone(),
                source,
            })?;

        if !was_available && now_available {
            let reason = new.and_then(|c| c.reason.clone()).unwrap_or_default();
            self.metrics.record_recovery(&name, &reason);
        }
        Ok(())
    }

    async fn process(&self, worker: usize, key: String) {
        let outcome = AssertUnwindSafe(self.sync(&key)).catch_unwind().await;
        self.queue.done(&key);
        match outcome {
            Ok(Ok(())) => self.queue.forget(&key),
            Ok(Err(err)) => {
                let delay = self.queue.retry(key.clone());
                warn!(
                    %key,
                    error = &err as &dyn std::error::Error,
                    ?delay,
                    "sync failed, requeueing"
                );
            }
            Err(_panic) => {
                // One key's crash must not take the worker down; the key is
                // not requeued and will be picked back up by the next resync.
                error!(%key, worker, "sync panicked");
            }
        }
    }

    /// Run the controller until `shutdown` resolves.
    ///
    /// `apiservice_events` and `service_events` are expected to be reflected
    /// watch streams feeding the stores this controller was constructed
    /// with. Spawns one dispatcher task plus `workers` sync workers; on
    /// shutdown the queue is closed, in-flight syncs finish, and the call
    /// returns.
    pub async fn run<SA, SS>(
        self,
        workers: usize,
        apiservice_events: SA,
        service_events: SS,
        shutdown: impl Future<Output = ()> + Send,
    ) where
        SA: Stream<Item = watcher::Event<APIService>> + Send + 'static,
        SS: Stream<Item = watcher::Event<Service>> + Send + 'static,
        C: 'static,
        R: 'static,
        D: 'static,
    {
        info!(workers, "starting APIService availability controller");
        let this = Arc::new(self);

        // The dispatcher must be polling before the stores can finish their
        // initial sync: reflected streams only make progress while consumed.
        let dispatcher = tokio::spawn({
            let this = Arc::clone(&this);
            async move {
                let events = stream::select(
                    apiservice_events.map(TopologyEvent::ApiService),
                    service_events.map(TopologyEvent::Backing),
                );
                futures::pin_mut!(events);
                let mut state = Dispatcher::default();
                while let Some(event) = events.next().await {
                    match &event {
                        TopologyEvent::ApiService(event) => {
                            this.handle_apiservice_event(&mut state, event);
                        }
                        TopologyEvent::Backing(event) => this.handle_service_event(event),
                    }
                }
            }
        });

        if this.apiservices.wait_until_ready().await.is_err()
            || this.services.wait_until_ready().await.is_err()
        {
            warn!("store writer dropped before initial sync completed");
        }
        debug!("informer caches synced");

        let resync = tokio::spawn({
            let this = Arc::clone(&this);
            async move {
                let mut interval = tokio::time::interval(this.config.resync_period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    for apiservice in this.apiservices.state() {
                        this.queue.add(apiservice.name_any());
                    }
                }
            }
        });

        let worker_tasks = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn({
                    let this = Arc::clone(&this);
                    async move {
                        while let Some(key) = this.queue.get().await {
                            this.process(worker, key).await;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        shutdown.await;
        info!("shutting down APIService availability controller");
        this.queue.shut_down();
        dispatcher.abort();
        resync.abort();
        for task in worker_tasks {
            let _ = task.await;
        }
    }
}
