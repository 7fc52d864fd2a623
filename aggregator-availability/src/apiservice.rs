//! Helpers for the `Available` status condition of an APIService

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
    kube_aggregator::pkg::apis::apiregistration::v1::{APIService, APIServiceCondition},
};

/// Condition type written by the availability controller.
pub const AVAILABLE: &str = "Available";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// The condition of the given type, if present.
#[must_use]
pub fn get_condition<'a>(
    apiservice: &'a APIService,
    condition_type: &str,
) -> Option<&'a APIServiceCondition> {
    apiservice
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == condition_type)
        })
}

/// Whether the APIService currently carries `Available == True`.
#[must_use]
pub fn is_available(apiservice: &APIService) -> bool {
    get_condition(apiservice, AVAILABLE).is_some_and(|condition| condition.status == CONDITION_TRUE)
}

/// Upsert a condition into the APIService's status.
///
/// The last-transition timestamp is preserved from the existing condition of
/// the same type whenever the status value is unchanged; it only moves when
/// the condition actually flips between True/False/Unknown.
pub fn set_condition(apiservice: &mut APIService, mut condition: APIServiceCondition) {
    let status = apiservice.status.get_or_insert_with(Default::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    match conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Constructors for the condition shapes the controller writes, stamped with
/// the current time.
pub mod conditions {
    use super::{APIServiceCondition, Time, Utc, AVAILABLE, CONDITION_FALSE, CONDITION_TRUE, CONDITION_UNKNOWN};

    fn available_condition(status: &str, reason: &str, message: String) -> APIServiceCondition {
        APIServiceCondition {
            type_: AVAILABLE.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message),
            last_transition_time: Some(Time(Utc::now())),
        }
    }

    /// APIServices with no backing service are served in-process and never
    /// probed.
    #[must_use]
    pub fn local() -> APIServiceCondition {
        available_condition(
            CONDITION_TRUE,
            "Local",
            "Local APIServices are always available".to_string(),
        )
    }

    #[must_use]
    pub fn passed() -> APIServiceCondition {
        available_condition(CONDITION_TRUE, "Passed", "all checks passed".to_string())
    }

    #[must_use]
    pub fn service_not_found(namespace: &str, name: &str) -> APIServiceCondition {
        available_condition(
            CONDITION_FALSE,
            "ServiceNotFound",
            format!("service/{name} in {namespace:?} is not present"),
        )
    }

    #[must_use]
    pub fn service_access_error(err: &dyn std::error::Error) -> APIServiceCondition {
        available_condition(
            CONDITION_UNKNOWN,
            "ServiceAccessError",
            format!("service cannot be checked: {err}"),
        )
    }

    #[must_use]
    pub fn failed_discovery_check(err: &dyn std::error::Error) -> APIServiceCondition {
        available_condition(
            CONDITION_FALSE,
            "FailedDiscoveryCheck",
            format!("failing or missing response from discovery: {err}"),
        )
    }
}
