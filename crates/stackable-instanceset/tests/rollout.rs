//! Drives a complete rollout: the update reconciler marks instances for replacement, the test
//! plays the part of the engine and the kubelet by recreating them with the new revision and
//! marking them as ready afterwards.

use std::collections::BTreeMap;

use jiff::Timestamp;
use k8s_openapi::{
    api::core::v1::{Pod, PodCondition, PodStatus},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use rstest::rstest;
use stackable_instanceset::{
    crd::{
        InstanceSet, InstanceSetSpec, InstanceSetStatus, MemberUpdateStrategy, REVISION_LABEL_KEY,
        ROLE_LABEL_KEY, ReplicaRole,
    },
    reconcile::{Continuation, ObjectTree, Reconciler, StatusReconciler, UpdateReconciler},
};

const OLD: &str = "rev-old";
const NEW: &str = "rev-new";

fn instance_set(strategy: MemberUpdateStrategy) -> InstanceSet {
    let mut its = InstanceSet::new("its", InstanceSetSpec {
        replicas: 6,
        roles: vec![
            ReplicaRole {
                name: "learner".to_owned(),
                participates_in_quorum: false,
            },
            ReplicaRole {
                name: "follower".to_owned(),
                participates_in_quorum: true,
            },
            ReplicaRole {
                name: "leader".to_owned(),
                participates_in_quorum: true,
            },
        ],
        member_update_strategy: strategy,
        ..InstanceSetSpec::default()
    });
    its.status = Some(InstanceSetStatus {
        update_revision: Some(NEW.to_owned()),
        current_revision: Some(OLD.to_owned()),
        ..InstanceSetStatus::default()
    });
    its
}

fn role_of(name: &str) -> &'static str {
    match name {
        "its-0" => "leader",
        "its-5" => "learner",
        _ => "follower",
    }
}

fn pod(name: &str, revision: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(BTreeMap::from([
                (REVISION_LABEL_KEY.to_owned(), revision.to_owned()),
                (ROLE_LABEL_KEY.to_owned(), role_of(name).to_owned()),
            ])),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            phase: Some(if ready { "Running" } else { "Pending" }.to_owned()),
            conditions: ready.then(|| {
                vec![PodCondition {
                    type_: "Ready".to_owned(),
                    status: "True".to_owned(),
                    ..PodCondition::default()
                }]
            }),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

fn clock() -> Timestamp {
    "2024-05-01T12:00:00Z".parse().unwrap()
}

#[rstest]
#[case::serial(MemberUpdateStrategy::Serial, vec![
    vec!["its-5"],
    vec!["its-4"],
    vec!["its-3"],
    vec!["its-2"],
    vec!["its-1"],
    vec!["its-0"],
])]
#[case::parallel(MemberUpdateStrategy::Parallel, vec![
    vec!["its-5", "its-4", "its-3", "its-2", "its-1", "its-0"],
])]
#[case::best_effort_parallel(MemberUpdateStrategy::BestEffortParallel, vec![
    vec!["its-5"],
    vec!["its-4", "its-3"],
    vec!["its-2", "its-1"],
    vec!["its-0"],
])]
fn rollout(#[case] strategy: MemberUpdateStrategy, #[case] expected_batches: Vec<Vec<&str>>) {
    let mut its = instance_set(strategy);
    let mut pods: BTreeMap<String, Pod> = (0..6)
        .map(|ordinal| {
            let name = format!("its-{ordinal}");
            (name.clone(), pod(&name, OLD, true))
        })
        .collect();

    let update = UpdateReconciler::default();
    let status = StatusReconciler::default().with_clock(clock);
    let mut batches = Vec::new();

    for _ in 0..=expected_batches.len() {
        let mut tree = ObjectTree::new(its.clone(), pods.values().cloned());
        status.reconcile(&mut tree).unwrap();
        its = tree.root().clone();

        let mut tree = ObjectTree::new(its.clone(), pods.values().cloned());
        assert!(update.pre_condition(&tree).is_satisfied());
        if update.reconcile(&mut tree).unwrap() == Continuation::Continue {
            break;
        }

        let batch = tree.replacements().to_vec();
        for name in &batch {
            pods.insert(name.clone(), pod(name, NEW, false));
        }
        batches.push(batch);

        // The replaced instances are not ready yet, so nothing else may be replaced
        let mut tree = ObjectTree::new(its.clone(), pods.values().cloned());
        assert_eq!(
            update.reconcile(&mut tree).unwrap(),
            Continuation::Continue,
            "replaced {:?} before the previous batch became ready",
            tree.replacements()
        );

        for name in batches.last().into_iter().flatten() {
            pods.insert(name.clone(), pod(name, NEW, true));
        }
    }

    assert_eq!(batches, expected_batches);

    let status = its.status.unwrap();
    assert_eq!(status.updated_replicas, 6);
    assert_eq!(status.current_revision.as_deref(), Some(NEW));
    assert_eq!(status.members_status[0].role, "leader");
}
