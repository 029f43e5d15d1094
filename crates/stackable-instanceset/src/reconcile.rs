//! The contract between InstanceSet reconcilers and the engine driving them.
//!
//! A reconciliation starts by loading the [`InstanceSet`] and its Pods into an [`ObjectTree`].
//! The engine then runs every [`Reconciler`] in order: reconcilers whose
//! [pre-condition](Reconciler::pre_condition) is not satisfied are skipped, all others mutate the
//! tree and tell the engine how to go on via a [`Continuation`]. Applying the changes recorded in
//! the tree to the API server is up to the engine.

use std::{collections::BTreeMap, time::Duration};

use jiff::Timestamp;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::{
    crd::InstanceSet,
    names,
    node_selector,
    plan::{self, UpdatePlan, UpdatePlanOptions},
    status::{StatusOptions, aggregate_status},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to plan the update of the instances"))]
    PlanUpdate { source: plan::Error },
}

/// How the engine should proceed after a reconciler ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// Run the next reconciler in the chain.
    Continue,

    /// Skip the remaining reconcilers and apply the changes recorded in the tree.
    Commit,

    /// Apply the changes and queue this object again after the given delay.
    RetryAfter(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckResult {
    Satisfied,
    Unsatisfied { reason: String },
}

impl CheckResult {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// The InstanceSet and the objects it owns, as observed at the start of a reconciliation.
#[derive(Clone, Debug)]
pub struct ObjectTree {
    root: InstanceSet,
    pods: BTreeMap<String, Pod>,
    replacements: Vec<String>,
}

impl ObjectTree {
    pub fn new(root: InstanceSet, pods: impl IntoIterator<Item = Pod>) -> Self {
        Self {
            root,
            pods: pods.into_iter().map(|pod| (pod.name_any(), pod)).collect(),
            replacements: Vec::new(),
        }
    }

    pub fn root(&self) -> &InstanceSet {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut InstanceSet {
        &mut self.root
    }

    pub fn pod(&self, name: &str) -> Option<&Pod> {
        self.pods.get(name)
    }

    /// All Pods, ordered by name.
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    /// Adds or replaces a Pod.
    pub fn put_pod(&mut self, pod: Pod) {
        self.pods.insert(pod.name_any(), pod);
    }

    pub fn remove_pod(&mut self, name: &str) -> Option<Pod> {
        self.pods.remove(name)
    }

    /// Marks the Pod to be deleted and recreated from its update revision.
    pub fn mark_for_replacement(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.replacements.contains(&name) {
            self.replacements.push(name);
        }
    }

    /// The Pods marked for replacement, in the order they were marked.
    pub fn replacements(&self) -> &[String] {
        &self.replacements
    }
}

pub trait Reconciler {
    fn pre_condition(&self, tree: &ObjectTree) -> CheckResult;

    fn reconcile(&self, tree: &mut ObjectTree) -> Result<Continuation, Error>;
}

fn check_root(tree: &ObjectTree) -> CheckResult {
    if tree.root().metadata.deletion_timestamp.is_some() {
        CheckResult::Unsatisfied {
            reason: "the InstanceSet is being deleted".to_owned(),
        }
    } else {
        CheckResult::Satisfied
    }
}

/// Writes the aggregated status into the root of the tree.
pub struct StatusReconciler {
    options: StatusOptions,
    clock: fn() -> Timestamp,
}

impl Default for StatusReconciler {
    fn default() -> Self {
        Self::new(StatusOptions::default())
    }
}

impl StatusReconciler {
    pub fn new(options: StatusOptions) -> Self {
        Self {
            options,
            clock: Timestamp::now,
        }
    }

    /// Replaces the source of the current time.
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }
}

impl Reconciler for StatusReconciler {
    fn pre_condition(&self, tree: &ObjectTree) -> CheckResult {
        check_root(tree)
    }

    #[instrument(skip_all, fields(instance_set = tree.root().name_any()))]
    fn reconcile(&self, tree: &mut ObjectTree) -> Result<Continuation, Error> {
        let pods: Vec<Pod> = tree.pods().cloned().collect();
        let update = aggregate_status(tree.root(), &pods, (self.clock)(), &self.options);

        let root = tree.root_mut();
        root.status = Some(update.status);
        if let Err(err) = node_selector::clear_scheduled_instances(root, &pods) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to clear one-time node placements"
            );
        }

        Ok(update.continuation)
    }
}

/// Marks the instances which should be replaced next, see [`UpdatePlan`].
#[derive(Default)]
pub struct UpdateReconciler {
    options: UpdatePlanOptions,
}

impl UpdateReconciler {
    pub fn new(options: UpdatePlanOptions) -> Self {
        Self { options }
    }
}

impl Reconciler for UpdateReconciler {
    fn pre_condition(&self, tree: &ObjectTree) -> CheckResult {
        let root = check_root(tree);
        if !root.is_satisfied() {
            return root;
        }

        match names::validate_spec(tree.root()) {
            Ok(()) => CheckResult::Satisfied,
            Err(err) => CheckResult::Unsatisfied {
                reason: err.to_string(),
            },
        }
    }

    #[instrument(skip_all, fields(instance_set = tree.root().name_any()))]
    fn reconcile(&self, tree: &mut ObjectTree) -> Result<Continuation, Error> {
        let replacements = UpdatePlan::new(tree.root(), tree.pods().cloned())
            .with_options(self.options.clone())
            .execute()
            .context(PlanUpdateSnafu)?;

        if replacements.is_empty() {
            return Ok(Continuation::Continue);
        }

        for pod in &replacements {
            tree.mark_for_replacement(pod.name_any());
        }
        tracing::info!(
            instances = ?tree.replacements(),
            "replacing outdated instances"
        );

        Ok(Continuation::Commit)
    }
}
