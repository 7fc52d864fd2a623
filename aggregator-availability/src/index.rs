//! Reverse index from backing services to their dependent APIServices

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::ResourceExt;
use parking_lot::RwLock;

/// Index of `(namespace, service name)` to the APIServices backed by that
/// service.
///
/// The index is derived state: it is rebuilt wholesale from a full APIService
/// snapshot whenever any service reference changes, and swapped in atomically
/// under the write lock. Readers get a clone of the dependent list and never
/// observe a partially-updated map.
#[derive(Default)]
pub struct ServiceIndex {
    index: RwLock<HashMap<(String, String), Vec<String>>>,
    generation: AtomicU64,
}

impl ServiceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index contents from a snapshot of all APIServices.
    pub fn rebuild<'a>(&self, apiservices: impl IntoIterator<Item = &'a APIService>) {
        let mut fresh: HashMap<(String, String), Vec<String>> = HashMap::new();
        for apiservice in apiservices {
            let Some(service) = apiservice.spec.as_ref().and_then(|spec| spec.service.as_ref())
            else {
                continue;
            };
            let namespace = service.namespace.clone().unwrap_or_default();
            let name = service.name.clone().unwrap_or_default();
            fresh
                .entry((namespace, name))
                .or_default()
                .push(apiservice.name_any());
        }
        *self.index.write() = fresh;
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Names of the APIServices backed by `(namespace, name)`.
    #[must_use]
    pub fn dependents(&self, namespace: &str, name: &str) -> Vec<String> {
        self.index
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of rebuilds since construction. Each rebuild replaces the whole
    /// index, so this doubles as a cheap change detector.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::ServiceIndex;
    use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
        APIService, APIServiceSpec, ServiceReference,
    };
    use kube::core::ObjectMeta;

    fn apiservice(name: &str, service: Option<(&str, &str)>) -> APIService {
        APIService {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(APIServiceSpec {
                service: service.map(|(namespace, svc)| ServiceReference {
                    namespace: Some(namespace.to_string()),
                    name: Some(svc.to_string()),
                    port: Some(443),
                }),
                ..APIServiceSpec::default()
            }),
            status: None,
        }
    }

    #[test]
    fn should_index_dependents_by_namespace_and_name() {
        let index = ServiceIndex::new();
        let apiservices = vec![
            apiservice("v1.foo.example.com", Some(("ns1", "svc1"))),
            apiservice("v2.foo.example.com", Some(("ns1", "svc1"))),
            apiservice("v1.bar.example.com", Some(("ns2", "svc1"))),
            apiservice("v1.local.example.com", None),
        ];
        index.rebuild(apiservices.iter());

        let mut dependents = index.dependents("ns1", "svc1");
        dependents.sort();
        assert_eq!(dependents, vec!["v1.foo.example.com", "v2.foo.example.com"]);
        assert_eq!(index.dependents("ns2", "svc1"), vec!["v1.bar.example.com"]);
        assert_eq!(index.dependents("ns3", "svc1"), Vec::<String>::new());
    }

    #[test]
    fn rebuild_should_replace_wholesale() {
        let index = ServiceIndex::new();
        index.rebuild(vec![apiservice("v1.foo.example.com", Some(("ns1", "svc1")))].iter());
        assert_eq!(index.generation(), 1);

        index.rebuild(vec![apiservice("v1.foo.example.com", Some(("ns1", "svc2")))].iter());
        assert_eq!(index.generation(), 2);
        assert!(index.dependents("ns1", "svc1").is_empty());
        assert_eq!(index.dependents("ns1", "svc2"), vec!["v1.foo.example.com"]);
    }
}
