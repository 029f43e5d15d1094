//! Helpers to inspect the observed state of instance Pods.

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use strum::{Display, EnumString};

use crate::crd::{REVISION_LABEL_KEY, ROLE_LABEL_KEY};

/// While the `phase` field of a Pod is a string only the values from this enum are allowed.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
pub enum PodConditionType {
    ContainersReady,
    Initialized,
    Ready,
    PodScheduled,
}

/// The phase of the Pod, [`None`] if the Pod has not been created or reports an unknown phase.
pub fn pod_phase(pod: &Pod) -> Option<PodPhase> {
    pod.status
        .as_ref()?
        .phase
        .as_deref()
        .and_then(|phase| phase.parse().ok())
}

/// Returns whether the Pod has been created in the API server by
/// checking whether the `status.phase` field exists and is not empty.
pub fn is_pod_created(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| !phase.is_empty())
}

pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_pod_failed(pod: &Pod) -> bool {
    pod_phase(pod) == Some(PodPhase::Failed)
}

/// Reports whether the `Ready` condition of the Pod is `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    get_pod_condition(pod, PodConditionType::Ready).is_some_and(|c| c.status == "True")
}

/// Reports whether a pod is running and ready by checking the phase of the pod as well as conditions.
/// The phase has to be "Running" and the "Ready" condition has to be `true`.
pub fn is_pod_running_and_ready(pod: &Pod) -> bool {
    pod_phase(pod) == Some(PodPhase::Running) && is_pod_ready(pod)
}

/// Returns for how long the Pod has been ready, [`None`] if it is not ready or the time it became
/// ready is unknown.
pub fn ready_duration(pod: &Pod, now: Timestamp) -> Option<SignedDuration> {
    let condition = get_pod_condition(pod, PodConditionType::Ready)?;
    if condition.status != "True" {
        return None;
    }

    let since = condition.last_transition_time.as_ref()?.0;
    Some(now.duration_since(since))
}

/// Reports whether the Pod is running and has been ready for at least `min_ready_seconds`.
pub fn is_pod_available(pod: &Pod, min_ready_seconds: i32, now: Timestamp) -> bool {
    if !is_pod_running_and_ready(pod) {
        return false;
    }
    if min_ready_seconds <= 0 {
        return true;
    }

    ready_duration(pod, now)
        .is_some_and(|ready| ready >= SignedDuration::from_secs(i64::from(min_ready_seconds)))
}

/// Returns how long the running and ready Pod still needs to stay ready before it becomes
/// available. [`None`] if the Pod is already available or not ready at all.
pub fn remaining_until_available(
    pod: &Pod,
    min_ready_seconds: i32,
    now: Timestamp,
) -> Option<SignedDuration> {
    if min_ready_seconds <= 0 || !is_pod_running_and_ready(pod) {
        return None;
    }

    let min_ready = SignedDuration::from_secs(i64::from(min_ready_seconds));
    // Without a transition time we can only assume that the Pod just became ready
    let ready = ready_duration(pod, now).unwrap_or(SignedDuration::ZERO);
    (ready < min_ready).then(|| min_ready - ready)
}

pub fn get_pod_condition(pod: &Pod, condition: PodConditionType) -> Option<&PodCondition> {
    let condition = condition.to_string();
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition)
}

/// The revision the Pod was created from, taken from the `controller-revision-hash` label.
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(REVISION_LABEL_KEY)
        .map(String::as_str)
}

/// Returns whether the role probe of the product reported a role for this Pod.
pub fn has_role_label(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(ROLE_LABEL_KEY))
}

/// The lowercased role of the Pod, empty if the Pod reports no role.
pub fn role_name(pod: &Pod) -> String {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ROLE_LABEL_KEY))
        .map(|role| role.to_lowercase())
        .unwrap_or_default()
}
