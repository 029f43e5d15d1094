//! Decides which outdated instances may be replaced next.
//!
//! The instances are arranged in an [`UpdateGraph`] according to the
//! [`MemberUpdateStrategy`] of the InstanceSet:
//!
//! * [`Serial`](MemberUpdateStrategy::Serial): a single chain in update order.
//! * [`Parallel`](MemberUpdateStrategy::Parallel): every instance hangs off the root.
//! * [`BestEffortParallel`](MemberUpdateStrategy::BestEffortParallel): four consecutive phases.
//!   First all instances which don't participate in the quorum, then one half of the followers,
//!   then the other half and finally the leader. This keeps a majority of the quorum members
//!   available at all times.
//!
//! The graph is then walked level by level. An outdated instance is selected for replacement, an
//! instance which is still being replaced (or isn't ready yet) makes the plan wait. In both cases
//! the instances of later levels are left alone for now. The plan is computed again after the
//! next change, so a rollout is driven by repeatedly executing the plan.

use std::error::Error as StdError;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tracing::instrument;

pub use self::graph::{UpdateGraph, WalkOutcome};
use crate::{
    crd::{InstanceSet, MemberUpdateStrategy},
    pod_utils,
    role::{self, RolePriorityMap},
    utils::sort::{pod_names, sort_pods},
};

pub mod graph;

/// The error type of a custom [`UpdatePlan::with_is_updated`] predicate.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

type IsUpdatedFn<'a> = dyn Fn(&InstanceSet, &Pod) -> Result<bool, BoxError> + 'a;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to determine whether instance {instance:?} is up to date"))]
    InspectInstance { instance: String, source: BoxError },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdatePlanOptions {
    /// During a serial update, instances are assumed to serve their role as soon as they are
    /// ready as long as no member has ever reported a role. Products which only report roles once
    /// the whole quorum is up would otherwise never get past the first instance.
    pub serial_skip_unprobed_roles: bool,
}

impl Default for UpdatePlanOptions {
    fn default() -> Self {
        Self {
            serial_skip_unprobed_roles: true,
        }
    }
}

/// What to do with a single instance while walking the plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Decision {
    Continue,
    Wait(&'static str),
    Replace,
}

pub struct UpdatePlan<'a> {
    its: &'a InstanceSet,
    pods: Vec<Pod>,
    options: UpdatePlanOptions,
    is_updated: Option<Box<IsUpdatedFn<'a>>>,
}

impl<'a> UpdatePlan<'a> {
    pub fn new(its: &'a InstanceSet, pods: impl IntoIterator<Item = Pod>) -> Self {
        Self {
            its,
            pods: pods.into_iter().collect(),
            options: UpdatePlanOptions::default(),
            is_updated: None,
        }
    }

    pub fn with_options(mut self, options: UpdatePlanOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the default check whether an instance runs its update revision.
    pub fn with_is_updated(
        mut self,
        is_updated: impl Fn(&InstanceSet, &Pod) -> Result<bool, BoxError> + 'a,
    ) -> Self {
        self.is_updated = Some(Box::new(is_updated));
        self
    }

    /// Returns the instances which should be replaced now, in update order.
    #[instrument(
        skip(self),
        fields(
            instance_set = self.its.name_any(),
            strategy = %self.its.spec.member_update_strategy,
        )
    )]
    pub fn execute(mut self) -> Result<Vec<Pod>, Error> {
        let priorities = RolePriorityMap::new(&self.its.spec.roles);
        let mut pods = std::mem::take(&mut self.pods);
        sort_pods(&mut pods, &priorities, false);

        let graph = self.build_graph(&pods, &priorities);

        let mut replacements = Vec::new();
        graph.walk_bfs(|pod| {
            Ok(match self.decide(pod)? {
                Decision::Continue => WalkOutcome::Continue,
                Decision::Wait(reason) => {
                    tracing::debug!(instance = pod.name_any(), reason, "waiting for instance");
                    WalkOutcome::Wait
                }
                Decision::Replace => {
                    replacements.push(*pod);
                    WalkOutcome::Stop
                }
            })
        })?;

        let replacements: Vec<Pod> = replacements.into_iter().cloned().collect();
        tracing::debug!(
            instances = ?pod_names(&replacements),
            "selected instances for replacement"
        );
        Ok(replacements)
    }

    fn build_graph<'p>(
        &self,
        pods: &'p [Pod],
        priorities: &RolePriorityMap,
    ) -> UpdateGraph<&'p Pod> {
        let mut graph = UpdateGraph::new();
        let root = UpdateGraph::<&Pod>::ROOT;

        match self.its.spec.member_update_strategy {
            MemberUpdateStrategy::Serial => {
                let mut previous = root;
                for pod in pods {
                    let vertex = graph.add_vertex(pod);
                    graph.connect(previous, vertex);
                    previous = vertex;
                }
            }
            MemberUpdateStrategy::Parallel => {
                for pod in pods {
                    let vertex = graph.add_vertex(pod);
                    graph.connect(root, vertex);
                }
            }
            MemberUpdateStrategy::BestEffortParallel => {
                let mut previous_phase = vec![root];
                for phase in best_effort_phases(pods, priorities) {
                    if phase.is_empty() {
                        continue;
                    }

                    let vertices: Vec<usize> =
                        phase.into_iter().map(|pod| graph.add_vertex(pod)).collect();
                    for &from in &previous_phase {
                        for &to in &vertices {
                            graph.connect(from, to);
                        }
                    }
                    previous_phase = vertices;
                }
            }
        }

        graph
    }

    fn decide(&self, pod: &Pod) -> Result<Decision, Error> {
        if pod_utils::is_pod_terminating(pod) {
            return Ok(Decision::Wait("terminating"));
        }

        if !self.is_updated(pod)? {
            return Ok(Decision::Replace);
        }

        if !pod_utils::is_pod_running_and_ready(pod) {
            return Ok(Decision::Wait("not ready"));
        }

        if self.is_role_ready(pod) {
            Ok(Decision::Continue)
        } else {
            Ok(Decision::Wait("role not probed yet"))
        }
    }

    fn is_role_ready(&self, pod: &Pod) -> bool {
        if role::is_role_ready(pod, &self.its.spec.roles) {
            return true;
        }

        self.options.serial_skip_unprobed_roles
            && self.its.spec.member_update_strategy == MemberUpdateStrategy::Serial
            && self
                .its
                .status
                .as_ref()
                .is_none_or(|status| status.members_status.is_empty())
    }

    fn is_updated(&self, pod: &Pod) -> Result<bool, Error> {
        match &self.is_updated {
            Some(is_updated) => is_updated(self.its, pod).context(InspectInstanceSnafu {
                instance: pod.name_any(),
            }),
            None => Ok(is_revision_updated(self.its, pod)),
        }
    }
}

/// Returns whether the Pod runs the revision it should run.
pub fn is_revision_updated(its: &InstanceSet, pod: &Pod) -> bool {
    let status = its.status_or_default();
    let target = status.update_revision_of(&pod.name_any()).unwrap_or_default();
    pod_utils::pod_revision(pod).unwrap_or_default() == target
}

/// Splits the (sorted) Pods into the phases of a best-effort parallel update.
fn best_effort_phases<'p>(
    pods: &'p [Pod],
    priorities: &RolePriorityMap,
) -> [Vec<&'p Pod>; 4] {
    let leader_priority = priorities.leader_priority();

    let (quorum, non_quorum): (Vec<&Pod>, Vec<&Pod>) = pods
        .iter()
        .partition(|pod| priorities.is_quorum_role(&pod_utils::role_name(pod)));
    let (followers, leaders): (Vec<&Pod>, Vec<&Pod>) = quorum
        .into_iter()
        .partition(|pod| Some(priorities.pod_priority(pod)) < leader_priority);

    let mut first_half = followers;
    let second_half = first_half.split_off(first_half.len() / 2);

    [non_quorum, first_half, second_half, leaders]
}
