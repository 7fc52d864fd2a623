//! Maps a backing service reference to a reachable URL

use http::Uri;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{ObjectRef, Store};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("service {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("service {namespace}/{name} has no resolvable host")]
    NoHost { namespace: String, name: String },
    #[error("invalid endpoint for service {namespace}/{name}")]
    InvalidEndpoint {
        namespace: String,
        name: String,
        #[source]
        source: http::Error,
    },
}

/// Resolves a `(namespace, service, port)` triple to a base URL.
///
/// Implementations must be pure lookups: no caching, no retries, safe for
/// concurrent use from multiple workers.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, namespace: &str, name: &str, port: u16) -> Result<Uri, ResolveError>;
}

/// [`EndpointResolver`] over an informer-backed [`Store`] of `Service`s.
///
/// The host is the service's `externalName`, falling back to its cluster IP
/// when no external name is set. The returned URL always uses `https`.
pub struct ExternalNameResolver {
    services: Store<Service>,
}

impl ExternalNameResolver {
    #[must_use]
    pub fn new(services: Store<Service>) -> Self {
        Self { services }
    }
}

fn host(service: &Service) -> Option<&str> {
    let spec = service.spec.as_ref()?;
    spec.external_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            spec.cluster_ip
                .as_deref()
                .filter(|ip| !ip.is_empty() && *ip != "None")
        })
}

impl EndpointResolver for ExternalNameResolver {
    fn resolve(&self, namespace: &str, name: &str, port: u16) -> Result<Uri, ResolveError> {
        let service = self
            .services
            .get(&ObjectRef::new(name).within(namespace))
            .ok_or_else(|| ResolveError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let host = host(&service).ok_or_else(|| ResolveError::NoHost {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
        Uri::builder()
            .scheme("https")
            .authority(format!("{host}:{port}"))
            .path_and_query("/")
            .build()
            .map_err(|source| ResolveError::InvalidEndpoint {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{EndpointResolver, ExternalNameResolver, ResolveError};
    use k8s_openapi::api::core::v1::{Service, ServiceSpec};
    use kube::{
        core::ObjectMeta,
        runtime::{reflector::store::Writer, watcher},
    };

    fn service(namespace: &str, name: &str, external_name: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                external_name: external_name.map(str::to_string),
                ..ServiceSpec::default()
            }),
            status: None,
        }
    }

    fn resolver(services: Vec<Service>) -> ExternalNameResolver {
        let mut writer = Writer::default();
        for service in services {
            writer.apply_watcher_event(&watcher::Event::Apply(service));
        }
        ExternalNameResolver::new(writer.as_reader())
    }

    #[test]
    fn should_resolve_external_name_to_https_url() {
        let resolver = resolver(vec![service("ns1", "svc1", Some("10.0.0.5"))]);
        let url = resolver.resolve("ns1", "svc1", 443).unwrap();
        assert_eq!(url.to_string(), "https://10.0.0.5:443/");
    }

    #[test]
    fn missing_service_should_be_not_found() {
        let resolver = resolver(vec![]);
        assert!(matches!(
            resolver.resolve("ns1", "svc1", 443),
            Err(ResolveError::NotFound { .. })
        ));
    }

    #[test]
    fn hostless_service_should_not_resolve() {
        let resolver = resolver(vec![service("ns1", "svc1", None)]);
        assert!(matches!(
            resolver.resolve("ns1", "svc1", 443),
            Err(ResolveError::NoHost { .. })
        ));
    }

    #[test]
    fn headless_cluster_ip_should_not_resolve() {
        let mut headless = service("ns1", "svc1", None);
        headless.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        let resolver = resolver(vec![headless]);
        assert!(matches!(
            resolver.resolve("ns1", "svc1", 443),
            Err(ResolveError::NoHost { .. })
        ));
    }
}
