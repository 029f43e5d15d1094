//! Aggregates the observed instances into the status of an [`InstanceSet`].
//!
//! The aggregation is a pure function of the InstanceSet, its Pods and the current time. It
//! counts the instances per state, maintains the revision bookkeeping, the role of every member
//! and the `InstanceReady`, `InstanceAvailable` and `InstanceFailure` conditions.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::instrument;

use crate::{
    crd::{InstanceSet, InstanceSetStatus, InstanceTemplateStatus, TEMPLATE_NAME_LABEL_KEY},
    names::{self, DEFAULT_TEMPLATE_NAME},
    plan::is_revision_updated,
    pod_utils,
    reconcile::Continuation,
    role::RolePriorityMap,
    status::{
        condition::{
            ConditionBuilder, ConditionSet, ConditionStatus, InstanceSetCondition,
            InstanceSetConditionType, compute_conditions,
        },
        members::MemberStatusStore,
    },
    utils::{image::is_pod_image_matched, sort::sort_names},
};

pub mod condition;
pub mod members;

pub const REASON_READY: &str = "Ready";
pub const REASON_NOT_READY: &str = "NotReady";
pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_NOT_AVAILABLE: &str = "NotAvailable";
pub const REASON_INSTANCE_FAILURE: &str = "InstanceFailure";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusOptions {
    /// The minimum delay before the status is computed again while instances are waiting to
    /// become available.
    pub availability_requeue_floor: Duration,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            availability_requeue_floor: Duration::from_secs(1),
        }
    }
}

/// The result of [`aggregate_status`].
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub status: InstanceSetStatus,

    /// [`Continuation::RetryAfter`] if some instances are ready, but not available yet.
    pub continuation: Continuation,
}

#[derive(Clone, Copy, Debug, Default)]
struct ReplicaCounters {
    replicas: i32,
    ready: i32,
    available: i32,
    updated: i32,
    current: i32,
}

/// The names of instances which are not in the desired state.
#[derive(Debug, Default)]
struct InstanceSummary {
    desired: i32,
    totals: ReplicaCounters,
    not_ready: BTreeSet<String>,
    not_available: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl ConditionBuilder for InstanceSummary {
    fn build_conditions(&self) -> ConditionSet {
        let mut conditions = ConditionSet::new();

        conditions.put(if self.not_ready.is_empty() && self.totals.ready >= self.desired {
            condition(InstanceSetConditionType::InstanceReady, REASON_READY, None)
        } else {
            condition(
                InstanceSetConditionType::InstanceReady,
                REASON_NOT_READY,
                Some(&self.not_ready),
            )
        });

        conditions.put(if self.not_available.is_empty() && self.totals.available == self.desired {
            condition(
                InstanceSetConditionType::InstanceAvailable,
                REASON_AVAILABLE,
                None,
            )
        } else {
            condition(
                InstanceSetConditionType::InstanceAvailable,
                REASON_NOT_AVAILABLE,
                Some(&self.not_available),
            )
        });

        if !self.failed.is_empty() {
            conditions.put(InstanceSetCondition {
                status: ConditionStatus::True,
                ..condition(
                    InstanceSetConditionType::InstanceFailure,
                    REASON_INSTANCE_FAILURE,
                    Some(&self.failed),
                )
            });
        }

        conditions
    }
}

/// Builds a condition which is `True` without `names` and `False` with the names as message.
fn condition(
    type_: InstanceSetConditionType,
    reason: &str,
    names: Option<&BTreeSet<String>>,
) -> InstanceSetCondition {
    InstanceSetCondition {
        type_,
        status: if names.is_some() {
            ConditionStatus::False
        } else {
            ConditionStatus::True
        },
        reason: Some(reason.to_owned()),
        message: names.map(names_message),
        last_transition_time: None,
    }
}

/// Renders the names as (naturally sorted) JSON array.
fn names_message(names: &BTreeSet<String>) -> String {
    let mut names: Vec<String> = names.iter().cloned().collect();
    sort_names(&mut names);
    serde_json::to_string(&names).unwrap_or_else(|_| format!("{names:?}"))
}

/// Computes the new status of the InstanceSet from its Pods.
#[instrument(skip_all, fields(instance_set = its.name_any()))]
pub fn aggregate_status(
    its: &InstanceSet,
    pods: &[Pod],
    now: Timestamp,
    options: &StatusOptions,
) -> StatusUpdate {
    let previous = its.status_or_default();
    let desired = its.spec.replicas;
    let min_ready_seconds = its.spec.min_ready_seconds;

    let name_to_template = names::build_instance_name_to_template_map(its).unwrap_or_else(|err| {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            "failed to resolve instance names, reporting without template counters"
        );
        BTreeMap::new()
    });
    let template_of = |pod: &Pod| -> Option<String> {
        let name = pod.name_any();
        name_to_template
            .get(&name)
            .map(|template| template.name.clone())
            .or_else(|| {
                pod.labels()
                    .get(TEMPLATE_NAME_LABEL_KEY)
                    .filter(|template| !template.is_empty())
                    .cloned()
            })
    };

    let mut total = ReplicaCounters::default();
    let mut per_template: BTreeMap<String, ReplicaCounters> = BTreeMap::new();
    let mut summary = InstanceSummary {
        desired,
        ..InstanceSummary::default()
    };
    let mut earliest_available: Option<SignedDuration> = None;
    let mut current_revisions = previous.current_revisions.clone();

    for pod in pods {
        let name = pod.name_any();
        let mut counters = ReplicaCounters::default();

        if pod_utils::is_pod_created(pod) {
            counters.replicas = 1;
            summary.not_ready.insert(name.clone());
            summary.not_available.insert(name.clone());

            if let Some(revision) = pod_utils::pod_revision(pod) {
                current_revisions
                    .entry(name.clone())
                    .or_insert_with(|| revision.to_owned());
            }
        }

        if is_pod_image_matched(pod) && pod_utils::is_pod_ready(pod) {
            counters.ready = 1;
            summary.not_ready.remove(&name);

            if pod_utils::is_pod_available(pod, min_ready_seconds, now) {
                counters.available = 1;
                summary.not_available.remove(&name);
            } else if let Some(remaining) =
                pod_utils::remaining_until_available(pod, min_ready_seconds, now)
            {
                earliest_available = Some(earliest_available.map_or(remaining, |e| e.min(remaining)));
            }
        }

        if pod_utils::is_pod_created(pod)
            && !pod_utils::is_pod_terminating(pod)
            && is_revision_updated(its, pod)
        {
            counters.updated = 1;
        }

        if pod_utils::is_pod_failed(pod) {
            summary.failed.insert(name);
        }

        total.add(counters);
        if let Some(template) = template_of(pod) {
            per_template.entry(template).or_default().add(counters);
        }
    }

    // Instances which should exist but have not been created yet
    for name in name_to_template.keys() {
        if !pods.iter().any(|pod| pod.name_any() == *name) {
            summary.not_ready.insert(name.clone());
            summary.not_available.insert(name.clone());
        }
    }
    summary.totals = total;

    let mut status = InstanceSetStatus {
        observed_generation: its.metadata.generation,
        replicas: total.replicas,
        ready_replicas: total.ready,
        available_replicas: total.available,
        updated_replicas: total.updated,
        update_revision: previous.update_revision.clone(),
        update_revisions: previous.update_revisions.clone(),
        current_revision: previous.current_revision.clone(),
        ..InstanceSetStatus::default()
    };

    // Drop bookkeeping of instances which are gone for good
    current_revisions.retain(|name, _| {
        name_to_template.contains_key(name) || pods.iter().any(|pod| pod.name_any() == *name)
    });
    status.current_revisions = current_revisions;
    if total.replicas == desired && total.updated == desired {
        status.current_revisions = status.update_revisions.clone();
        status.current_revision = status.update_revision.clone();
    }

    for pod in pods.iter().filter(|pod| pod_utils::is_pod_created(pod)) {
        let name = pod.name_any();
        if pod_utils::pod_revision(pod).is_some()
            && pod_utils::pod_revision(pod) == status.current_revision_of(&name)
        {
            status.current_replicas += 1;
            if let Some(template) = template_of(pod) {
                per_template.entry(template).or_default().current += 1;
            }
        }
    }

    status.templates_status = its
        .spec
        .instances
        .iter()
        .filter(|template| template.name != DEFAULT_TEMPLATE_NAME)
        .map(|template| {
            let counters = per_template
                .get(&template.name)
                .copied()
                .unwrap_or_default();
            InstanceTemplateStatus {
                name: template.name.clone(),
                replicas: counters.replicas,
                ready_replicas: counters.ready,
                available_replicas: counters.available,
                updated_replicas: counters.updated,
                current_replicas: counters.current,
            }
        })
        .collect();

    let priorities = RolePriorityMap::new(&its.spec.roles);
    let mut members = MemberStatusStore::new(&previous.members_status);
    members.refresh(pods, &priorities);
    status.members_status =
        members.into_sorted(pods, &priorities, usize::try_from(desired).unwrap_or_default());

    status.conditions = compute_conditions(&previous.conditions, &summary, now);

    let continuation = match earliest_available {
        Some(remaining) => {
            Continuation::RetryAfter(remaining.unsigned_abs().max(options.availability_requeue_floor))
        }
        None => Continuation::Continue,
    };

    tracing::debug!(
        replicas = status.replicas,
        ready = status.ready_replicas,
        available = status.available_replicas,
        updated = status.updated_replicas,
        current = status.current_replicas,
        ?continuation,
        "aggregated instance status"
    );

    StatusUpdate {
        status,
        continuation,
    }
}

impl ReplicaCounters {
    fn add(&mut self, other: Self) {
        self.replicas += other.replicas;
        self.ready += other.ready;
        self.available += other.available;
        self.updated += other.updated;
        self.current += other.current;
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{Container, ContainerStatus, PodCondition, PodSpec, PodStatus},
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    };
    use rstest::rstest;

    use super::*;
    use crate::crd::{InstanceSetSpec, InstanceTemplate, REVISION_LABEL_KEY};

    const OLD: &str = "rev-old";
    const NEW: &str = "rev-new";

    fn now() -> Timestamp {
        "2024-05-01T12:00:00Z".parse().unwrap()
    }

    fn instance_set(replicas: i32, min_ready_seconds: i32) -> InstanceSet {
        let mut its = InstanceSet::new("its", InstanceSetSpec {
            replicas,
            min_ready_seconds,
            ..InstanceSetSpec::default()
        });
        its.metadata.generation = Some(3);
        its.status = Some(InstanceSetStatus {
            update_revision: Some(NEW.to_owned()),
            current_revision: Some(OLD.to_owned()),
            ..InstanceSetStatus::default()
        });
        its
    }

    /// A running pod which has been ready for `ready_for` seconds.
    fn pod(name: &str, revision: &str, ready_for: Option<i64>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(BTreeMap::from([(
                    REVISION_LABEL_KEY.to_owned(),
                    revision.to_owned(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_owned(),
                    image: Some("nginx:1.27".to_owned()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_owned()),
                conditions: ready_for.map(|secs| {
                    vec![PodCondition {
                        type_: "Ready".to_owned(),
                        status: "True".to_owned(),
                        last_transition_time: Some(Time(now() - SignedDuration::from_secs(secs))),
                        ..PodCondition::default()
                    }]
                }),
                container_statuses: Some(vec![ContainerStatus {
                    name: "main".to_owned(),
                    image: "docker.io/library/nginx:1.27".to_owned(),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
        }
    }

    fn get_condition(
        status: &InstanceSetStatus,
        type_: InstanceSetConditionType,
    ) -> Option<&InstanceSetCondition> {
        status.conditions.iter().find(|c| c.type_ == type_)
    }

    #[test]
    fn missing_instances_are_reported_not_ready() {
        let its = instance_set(3, 0);
        let pods = vec![pod("its-0", NEW, Some(60)), pod("its-2", NEW, Some(60))];

        let update = aggregate_status(&its, &pods, now(), &StatusOptions::default());
        let status = &update.status;

        assert_eq!(status.replicas, 2);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.observed_generation, Some(3));

        let ready = get_condition(status, InstanceSetConditionType::InstanceReady).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some(REASON_NOT_READY));
        assert_eq!(ready.message.as_deref(), Some(r#"["its-1"]"#));
        assert_eq!(update.continuation, Continuation::Continue);
    }

    #[test]
    fn image_mismatch_is_not_ready() {
        let its = instance_set(1, 0);
        let mut pod = pod("its-0", NEW, Some(60));
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "main".to_owned(),
                image: "nginx:1.26".to_owned(),
                ..ContainerStatus::default()
            }]);
        }

        let status = aggregate_status(&its, &[pod], now(), &StatusOptions::default()).status;

        assert_eq!(status.replicas, 1);
        assert_eq!(status.ready_replicas, 0);
        assert_eq!(status.available_replicas, 0);
    }

    #[test]
    fn failed_instances() {
        let its = instance_set(2, 0);
        let mut failed = pod("its-1", NEW, None);
        if let Some(status) = failed.status.as_mut() {
            status.phase = Some("Failed".to_owned());
        }
        let pods = vec![pod("its-0", NEW, Some(10)), failed];

        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;

        let failure = get_condition(&status, InstanceSetConditionType::InstanceFailure).unwrap();
        assert_eq!(failure.status, ConditionStatus::True);
        assert_eq!(failure.reason.as_deref(), Some(REASON_INSTANCE_FAILURE));
        assert_eq!(failure.message.as_deref(), Some(r#"["its-1"]"#));

        // The failure condition disappears once the instance recovered
        let mut its = its;
        its.status = Some(status);
        let pods = vec![pod("its-0", NEW, Some(10)), pod("its-1", NEW, Some(10))];
        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;

        assert!(get_condition(&status, InstanceSetConditionType::InstanceFailure).is_none());
        assert_eq!(status.conditions.len(), 2);
    }

    #[rstest]
    #[case::earliest_remaining(&[2, 7], 1, 3)]
    #[case::floor(&[9, 7], 5, 5)]
    fn retry_until_available(
        #[case] ready_for: &[i64],
        #[case] floor_secs: u64,
        #[case] expected_secs: u64,
    ) {
        let its = instance_set(3, 10);
        let mut pods: Vec<Pod> = ready_for
            .iter()
            .enumerate()
            .map(|(ordinal, secs)| pod(&format!("its-{ordinal}"), NEW, Some(*secs)))
            .collect();
        pods.push(pod("its-2", NEW, Some(30)));

        let options = StatusOptions {
            availability_requeue_floor: Duration::from_secs(floor_secs),
        };

        let update = aggregate_status(&its, &pods, now(), &options);

        assert_eq!(update.status.ready_replicas, 3);
        assert_eq!(update.status.available_replicas, 1);
        assert_eq!(
            update.continuation,
            Continuation::RetryAfter(Duration::from_secs(expected_secs))
        );
    }

    #[test]
    fn aggregation_is_idempotent() {
        let mut its = instance_set(2, 0);
        let pods = vec![pod("its-0", NEW, Some(10)), pod("its-1", OLD, None)];

        let first = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;
        its.status = Some(first.clone());
        let later = now() + SignedDuration::from_secs(30);
        let second = aggregate_status(&its, &pods, later, &StatusOptions::default()).status;

        assert_eq!(first, second);
    }

    #[test]
    fn current_revision_moves_once_all_instances_are_updated() {
        let its = instance_set(2, 0);

        let pods = vec![pod("its-0", NEW, Some(10)), pod("its-1", OLD, Some(10))];
        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;
        assert_eq!(status.updated_replicas, 1);
        assert_eq!(status.current_replicas, 2);
        assert_eq!(status.current_revision.as_deref(), Some(OLD));
        assert_eq!(status.current_revisions["its-0"], NEW);

        let pods = vec![pod("its-0", NEW, Some(10)), pod("its-1", NEW, Some(10))];
        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;
        assert_eq!(status.updated_replicas, 2);
        assert_eq!(status.current_replicas, 2);
        assert_eq!(status.current_revision.as_deref(), Some(NEW));
        assert!(status.current_revisions.is_empty());
    }

    #[test]
    fn surplus_instances_are_not_available() {
        // Scaled in from 2 to 1, its-1 has not been removed yet
        let its = instance_set(1, 0);
        let pods = vec![pod("its-0", NEW, Some(10)), pod("its-1", NEW, Some(10))];

        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;

        assert_eq!(status.available_replicas, 2);
        let available =
            get_condition(&status, InstanceSetConditionType::InstanceAvailable).unwrap();
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason.as_deref(), Some(REASON_NOT_AVAILABLE));
    }

    #[test]
    fn terminating_instances_are_not_updated() {
        let its = instance_set(1, 0);
        let mut pod = pod("its-0", NEW, Some(10));
        pod.metadata.deletion_timestamp = Some(Time(now()));

        let status = aggregate_status(&its, &[pod], now(), &StatusOptions::default()).status;

        assert_eq!(status.replicas, 1);
        assert_eq!(status.updated_replicas, 0);
    }

    #[test]
    fn per_template_counters() {
        let mut its = instance_set(3, 0);
        its.spec.instances = vec![InstanceTemplate {
            name: "hello".to_owned(),
            ..InstanceTemplate::default()
        }];
        let pods = vec![
            pod("its-0", NEW, Some(10)),
            pod("its-1", OLD, None),
            pod("its-hello-0", NEW, Some(10)),
        ];

        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;

        assert_eq!(status.templates_status, vec![InstanceTemplateStatus {
            name: "hello".to_owned(),
            replicas: 1,
            ready_replicas: 1,
            available_replicas: 1,
            updated_replicas: 1,
            // first seen with the update revision
            current_replicas: 1,
        }]);
    }

    #[rstest]
    #[case::more_than_spec_replicas(&[2])]
    #[case::sum_beyond_i32(&[i32::MAX, 2])]
    fn invalid_templates_degrade_gracefully(#[case] template_replicas: &[i32]) {
        let mut its = instance_set(1, 0);
        its.spec.instances = template_replicas
            .iter()
            .enumerate()
            .map(|(index, replicas)| InstanceTemplate {
                name: format!("hello{index}"),
                replicas: Some(*replicas),
                ..InstanceTemplate::default()
            })
            .collect();
        let pods = vec![pod("its-0", NEW, Some(10))];

        let status = aggregate_status(&its, &pods, now(), &StatusOptions::default()).status;

        assert_eq!(status.replicas, 1);
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.templates_status[0].replicas, 0);
    }
}
