//! Availability metrics
//!
//! Observability only: nothing in the control loop reads these back.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use prometheus::{
    core::{Collector, Desc},
    proto, IntCounterVec, Opts, Registry,
};

const GAUGE_NAME: &str = "aggregator_apiservice_available";
const GAUGE_HELP: &str =
    "Availability of an aggregated APIService. 1 when available, 0 when unavailable.";
const COUNTER_NAME: &str = "aggregator_apiservice_recoveries_total";
const COUNTER_HELP: &str =
    "Number of times an aggregated APIService transitioned to available, by reason.";

/// Custom collector emitting one gauge sample per tracked APIService.
///
/// Tracked names are added/updated on every controller sync and removed when
/// the APIService is deleted, so scrapes never report stale series.
#[derive(Clone)]
struct AvailabilityGauge {
    desc: Desc,
    state: Arc<RwLock<BTreeMap<String, bool>>>,
}

impl AvailabilityGauge {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            desc: Desc::new(
                GAUGE_NAME.to_string(),
                GAUGE_HELP.to_string(),
                vec!["name".to_string()],
                std::collections::HashMap::new(),
            )?,
            state: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }
}

impl Collector for AvailabilityGauge {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let state = self.state.read();
        let mut samples = Vec::with_capacity(state.len());
        for (name, available) in state.iter() {
            let mut label = proto::LabelPair::default();
            label.set_name("name".to_string());
            label.set_value(name.clone());
            let mut gauge = proto::Gauge::default();
            gauge.set_value(if *available { 1.0 } else { 0.0 });
            let mut metric = proto::Metric::default();
            metric.set_label(vec![label].into());
            metric.set_gauge(gauge);
            samples.push(metric);
        }
        let mut family = proto::MetricFamily::default();
        family.set_name(GAUGE_NAME.to_string());
        family.set_help(GAUGE_HELP.to_string());
        family.set_field_type(proto::MetricType::GAUGE);
        family.set_metric(samples.into());
        vec![family]
    }
}

/// Availability metrics, constructed explicitly and injected into the
/// controller.
pub struct Metrics {
    availability: AvailabilityGauge,
    recoveries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            availability: AvailabilityGauge::new()?,
            recoveries: IntCounterVec::new(
                Opts::new(COUNTER_NAME, COUNTER_HELP),
                &["name", "reason"],
            )?,
        })
    }

    /// Register both collectors into `registry`.
    ///
    /// Idempotent: registering the same metrics a second time is a no-op, so
    /// constructing several controllers against one registry cannot panic the
    /// process on a duplicate metric name.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for collector in [
            Box::new(self.availability.clone()) as Box<dyn Collector>,
            Box::new(self.recoveries.clone()),
        ] {
            match registry.register(collector) {
                Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Record the availability of `name`, overwriting any previous sample.
    pub fn set_available(&self, name: &str, available: bool) {
        self.availability
            .state
            .write()
            .insert(name.to_string(), available);
    }

    /// Drop the series for a deleted APIService.
    pub fn forget(&self, name: &str) {
        self.availability.state.write().remove(name);
    }

    /// Record a not-available to available transition. Edge-triggered by the
    /// caller: level repeats must not be recorded.
    pub fn record_recovery(&self, name: &str, reason: &str) {
        self.recoveries.with_label_values(&[name, reason]).inc();
    }

    /// Current value of the recovery counter for a `(name, reason)` pair.
    #[must_use]
    pub fn recovery_count(&self, name: &str, reason: &str) -> u64 {
        self.recoveries.with_label_values(&[name, reason]).get()
    }
}
