//! Ordering of instances by role priority, parent name and ordinal.
//!
//! The base ordering sorts by role priority ascending, then by parent name descending and finally
//! by ordinal descending. This is the order in which instances are updated: low priority roles
//! first and, within the same role, higher ordinals before lower ordinals.
//!
//! The reverse ordering is used for reporting, e.g. for the member status and name lists.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::{crd::MemberStatus, names::parse_parent_name_and_ordinal, role::RolePriorityMap};

/// Sorts `items` according to the base ordering, or its inverse if `reverse` is set.
///
/// The sort is stable, items which compare equal keep their relative order.
pub fn base_sort<T>(
    items: &mut [T],
    name_of: impl Fn(&T) -> &str,
    priority_of: impl Fn(&T) -> i32,
    reverse: bool,
) {
    items.sort_by(|a, b| {
        let ordering = compare(name_of(a), priority_of(a), name_of(b), priority_of(b));
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn compare(name_a: &str, priority_a: i32, name_b: &str, priority_b: i32) -> Ordering {
    let (parent_a, ordinal_a) = parse_parent_name_and_ordinal(name_a);
    let (parent_b, ordinal_b) = parse_parent_name_and_ordinal(name_b);

    priority_a
        .cmp(&priority_b)
        .then_with(|| parent_b.cmp(parent_a))
        .then_with(|| ordinal_b.cmp(&ordinal_a))
}

/// Sorts Pods in update order.
pub fn sort_pods(pods: &mut [Pod], priorities: &RolePriorityMap, reverse: bool) {
    base_sort(
        pods,
        |pod| pod.metadata.name.as_deref().unwrap_or_default(),
        |pod| priorities.pod_priority(pod),
        reverse,
    );
}

/// Sorts instance names by parent name and ordinal, both ascending.
pub fn sort_names(names: &mut [String]) {
    base_sort(names, String::as_str, |_| 0, true);
}

/// Sorts members by role priority descending, so that leaders come first.
pub fn sort_members(members: &mut [MemberStatus], priorities: &RolePriorityMap) {
    base_sort(
        members,
        |member| member.pod_name.as_str(),
        |member| priorities.priority(&member.role),
        true,
    );
}

/// The names of the given Pods, in their current order.
pub fn pod_names(pods: &[Pod]) -> Vec<String> {
    pods.iter().map(ResourceExt::name_any).collect()
}
