//! Active discovery probing of remote API services
//!
//! A probe is an HTTP GET against the per-group-version discovery path, used
//! purely as a reachability check. Probes are issued redundantly so that one
//! flaky replica behind a load-balanced service does not mark the whole
//! APIService unavailable.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use http::Uri;
use thiserror::Error;

/// Proxy identity presented to the probed discovery endpoint.
const REMOTE_USER_HEADER: &str = "X-Remote-User";
const REMOTE_GROUP_HEADER: &str = "X-Remote-Group";
const AGGREGATOR_USER: &str = "system:kube-aggregator";
const AGGREGATOR_GROUP: &str = "system:masters";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no response within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("bad status from discovery endpoint: {0}")]
    BadStatus(http::StatusCode),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Client certificate and key presented to the probed endpoint, both PEM.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl ClientIdentity {
    fn pem(&self) -> Vec<u8> {
        let mut pem = self.cert_pem.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&self.key_pem);
        pem
    }
}

/// A single discovery attempt against a resolved URL.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn check(&self, url: &Uri, identity: Option<&ClientIdentity>) -> Result<(), ProbeError>;
}

/// The discovery path for a group/version pair.
///
/// The legacy core group (empty group name) lives under `/api`, everything
/// else under `/apis/{group}`.
#[must_use]
pub fn discovery_path(group: &str, version: &str) -> String {
    if group.is_empty() {
        format!("/api/{version}")
    } else {
        format!("/apis/{group}/{version}")
    }
}

/// Join a resolved service base URL with the discovery path.
pub fn discovery_url(base: &Uri, group: &str, version: &str) -> Result<Uri, http::Error> {
    let mut builder = Uri::builder().path_and_query(discovery_path(group, version));
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.build()
}

/// Issue `attempts` concurrent discovery checks, succeeding on the first 2xx.
///
/// Each attempt runs under its own hard `deadline`, independent of whatever
/// timeout the client enforces internally. The first success cancels the
/// remaining attempts; if every attempt fails, the last observed error is
/// returned.
pub async fn check_any<C>(
    client: &C,
    url: &Uri,
    identity: Option<&ClientIdentity>,
    attempts: usize,
    deadline: Duration,
) -> Result<(), ProbeError>
where
    C: DiscoveryClient + ?Sized,
{
    let probes = (0..attempts.max(1))
        .map(|_| {
            async move {
                match tokio::time::timeout(deadline, client.check(url, identity)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProbeError::DeadlineExceeded(deadline)),
                }
            }
            .boxed()
        })
        .collect::<Vec<_>>();
    // Losing attempts are dropped as soon as one succeeds.
    future::select_ok(probes).await.map(|_| ())
}

/// Production [`DiscoveryClient`] over `reqwest`.
///
/// The client is rebuilt on every check so that a rotated client certificate
/// takes effect without restarting the controller. TLS verification is
/// disabled: the probe targets in-cluster services addressed by IP or
/// external name, where the serving certificate rarely matches, and the probe
/// is a reachability check rather than a trust decision.
pub struct HttpDiscovery {
    request_timeout: Duration,
}

impl HttpDiscovery {
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpDiscovery {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn check(&self, url: &Uri, identity: Option<&ClientIdentity>) -> Result<(), ProbeError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .timeout(self.request_timeout);
        if let Some(identity) = identity {
            builder = builder.identity(reqwest::Identity::from_pem(&identity.pem())?);
        }
        let client = builder.build()?;
        let response = client
            .get(url.to_string())
            .header(REMOTE_USER_HEADER, AGGREGATOR_USER)
            .header(REMOTE_GROUP_HEADER, AGGREGATOR_GROUP)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::BadStatus(response.status()))
        }
    }
}
