//! Role priorities of instances.
//!
//! The roles of an [`InstanceSet`](crate::crd::InstanceSet) are declared in ascending update
//! priority: the first declared role is updated first, the last declared role (usually the
//! leader) is updated last. Instances without a role, or with a role which is not declared,
//! have the lowest priority and are updated before everybody else.
//!
//! Role names are compared case-insensitively.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;

use crate::{crd::ReplicaRole, pod_utils};

/// The priority of instances without a (declared) role.
pub const EMPTY_PRIORITY: i32 = -1;

/// Maps (lowercased) role names to their update priority.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolePriorityMap {
    priorities: HashMap<String, i32>,
    quorum_roles: HashMap<String, i32>,
}

impl RolePriorityMap {
    pub fn new(roles: &[ReplicaRole]) -> Self {
        let mut map = Self::default();

        for (rank, role) in roles.iter().enumerate() {
            let name = role.name.to_lowercase();
            if name.is_empty() || map.priorities.contains_key(&name) {
                continue;
            }

            let rank = rank as i32;
            if role.participates_in_quorum {
                map.quorum_roles.insert(name.clone(), rank);
            }
            map.priorities.insert(name, rank);
        }

        map
    }

    /// The priority of the given role, [`EMPTY_PRIORITY`] for unknown roles.
    pub fn priority(&self, role: &str) -> i32 {
        self.priorities
            .get(&role.to_lowercase())
            .copied()
            .unwrap_or(EMPTY_PRIORITY)
    }

    /// The priority of the role the Pod currently reports.
    pub fn pod_priority(&self, pod: &Pod) -> i32 {
        self.priority(&pod_utils::role_name(pod))
    }

    pub fn is_declared(&self, role: &str) -> bool {
        self.priorities.contains_key(&role.to_lowercase())
    }

    pub fn is_quorum_role(&self, role: &str) -> bool {
        self.quorum_roles.contains_key(&role.to_lowercase())
    }

    /// The priority of the leader, i.e. the highest priority among the roles participating in
    /// the quorum. Returns [`None`] if no role participates in the quorum.
    pub fn leader_priority(&self) -> Option<i32> {
        self.quorum_roles.values().copied().max()
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }
}

/// Returns whether the Pod is ready to serve its role.
///
/// Without declared roles every Pod is considered to be ready. Otherwise the role probe of the
/// product must have reported a role, as Pods without a role label have not been probed yet.
pub fn is_role_ready(pod: &Pod, roles: &[ReplicaRole]) -> bool {
    roles.is_empty() || pod_utils::has_role_label(pod)
}
