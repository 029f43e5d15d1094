use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::{
    crd::MemberStatus,
    pod_utils,
    role::RolePriorityMap,
    utils::sort::sort_members,
};

/// Tracks the role every instance was last seen with.
///
/// The store is seeded with the previously reported members and refreshed from the observed
/// Pods. Members of Pods which are being deleted are kept until the Pod is gone, so that a
/// leader which is shutting down is still reported as such.
#[derive(Clone, Debug, Default)]
pub struct MemberStatusStore {
    members: BTreeMap<String, MemberStatus>,
}

impl MemberStatusStore {
    pub fn new(previous: &[MemberStatus]) -> Self {
        Self {
            members: previous
                .iter()
                .map(|member| (member.pod_name.clone(), member.clone()))
                .collect(),
        }
    }

    /// Refreshes the store from the observed Pods.
    pub fn refresh(&mut self, pods: &[Pod], priorities: &RolePriorityMap) {
        let pods_by_name: BTreeMap<String, &Pod> =
            pods.iter().map(|pod| (pod.name_any(), pod)).collect();

        self.members.retain(|name, member| match pods_by_name.get(name) {
            Some(pod) if pod_utils::is_pod_terminating(pod) => {
                member.ready = pod_utils::is_pod_running_and_ready(pod);
                true
            }
            _ => false,
        });

        for (name, pod) in pods_by_name {
            if !pod_utils::has_role_label(pod) {
                continue;
            }

            let role = pod_utils::role_name(pod);
            if !priorities.is_declared(&role) {
                tracing::debug!(instance = %name, %role, "ignoring undeclared role");
                continue;
            }

            let ready = pod_utils::is_pod_running_and_ready(pod);
            self.members
                .entry(name.clone())
                .and_modify(|member| {
                    member.role.clone_from(&role);
                    member.ready = ready;
                })
                .or_insert_with(|| MemberStatus {
                    pod_name: name,
                    role,
                    ready,
                });
        }
    }

    /// Returns at most `replicas` members, leaders first.
    ///
    /// If there are more members than replicas, members of terminating Pods are dropped first.
    pub fn into_sorted(
        self,
        pods: &[Pod],
        priorities: &RolePriorityMap,
        replicas: usize,
    ) -> Vec<MemberStatus> {
        let mut members: Vec<MemberStatus> = self.members.into_values().collect();
        sort_members(&mut members, priorities);

        if members.len() > replicas {
            let terminating: Vec<String> = pods
                .iter()
                .filter(|pod| pod_utils::is_pod_terminating(pod))
                .map(ResourceExt::name_any)
                .collect();

            let mut excess = members.len() - replicas;
            members.retain(|member| {
                if excess > 0 && terminating.contains(&member.pod_name) {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
            members.truncate(replicas);
        }

        members
    }
}
