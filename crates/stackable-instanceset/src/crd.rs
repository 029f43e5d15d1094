//! The [`InstanceSet`] custom resource.
//!
//! An InstanceSet manages a group of named Pods ("instances") which are created from one default
//! Pod template plus any number of named [`InstanceTemplate`]s. Every instance has a stable name
//! of the form `<parent>[-<templateName>]-<ordinal>`, see [`crate::names`].
//!
//! Instances can carry a role (e.g. `leader`, `follower`) which is reported by the product via the
//! [`ROLE_LABEL_KEY`] label. The order in which roles are declared in [`InstanceSetSpec::roles`]
//! defines the update priority: roles declared later are updated later.

use std::collections::BTreeMap;

use const_format::concatcp;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::status::condition::InstanceSetCondition;

/// The Stackable-specific workloads key prefix.
const WORKLOADS_KEY_PREFIX: &str = "workloads.stackable.tech/";

/// The label which carries the role of an instance, e.g. `leader`. It is set by the role probe
/// of the product, not by the operator.
pub const ROLE_LABEL_KEY: &str = concatcp!(WORKLOADS_KEY_PREFIX, "role");

/// The label which carries the template name an instance was created from.
pub const TEMPLATE_NAME_LABEL_KEY: &str = concatcp!(WORKLOADS_KEY_PREFIX, "instance-template");

/// The annotation on an [`InstanceSet`] which pins instances to a node for their next creation.
/// The value is a JSON object mapping instance names to node names, see [`crate::node_selector`].
pub const NODE_SELECTOR_ONCE_ANNOTATION_KEY: &str =
    concatcp!(WORKLOADS_KEY_PREFIX, "node-selector-once");

/// The well-known Kubernetes label which carries the revision hash of a Pod.
pub const REVISION_LABEL_KEY: &str = "controller-revision-hash";

/// Manages a set of named, ordered and role-aware instances of a product.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "workloads.stackable.tech",
    version = "v1alpha1",
    kind = "InstanceSet",
    plural = "instancesets",
    shortname = "its",
    status = "InstanceSetStatus",
    namespaced,
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetSpec {
    /// The total number of desired instances, including the instances of all named templates.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// The Pod template all instances are based on.
    #[serde(default)]
    #[schemars(schema_with = "raw_object_schema")]
    pub template: PodTemplateSpec,

    /// Named templates overriding parts of the default template for some of the instances.
    /// Instances which are not covered by a named template use the default template.
    #[serde(default)]
    pub instances: Vec<InstanceTemplate>,

    /// The ordinals used for instances of the default template.
    #[serde(default)]
    pub default_template_ordinals: Ordinals,

    /// Names of instances which are taken offline. Their names are never handed out again.
    #[serde(default)]
    pub offline_instances: Vec<String>,

    /// The roles of the product, in ascending update priority.
    #[serde(default)]
    pub roles: Vec<ReplicaRole>,

    /// How outdated instances are replaced.
    #[serde(default)]
    pub member_update_strategy: MemberUpdateStrategy,

    /// Minimum number of seconds an instance needs to be ready before it is considered available.
    #[serde(default)]
    pub min_ready_seconds: i32,
}

impl Default for InstanceSetSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            template: PodTemplateSpec::default(),
            instances: Vec::new(),
            default_template_ordinals: Ordinals::default(),
            offline_instances: Vec::new(),
            roles: Vec::new(),
            member_update_strategy: MemberUpdateStrategy::default(),
            min_ready_seconds: 0,
        }
    }
}

const fn default_replicas() -> i32 {
    1
}

fn raw_object_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

/// A named template describing a subset of the instances.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    /// The name of the template. It becomes the middle segment of the instance names.
    pub name: String,

    /// Number of instances created from this template. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Explicit ordinals for the instances of this template.
    #[serde(default)]
    pub ordinals: Ordinals,

    /// Labels merged into the labels of the default template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations merged into the annotations of the default template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Overrides the image of the first container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl InstanceTemplate {
    /// The number of instances of this template, a template without explicit replicas counts
    /// as one instance.
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

/// A set of ordinals, given as inclusive ranges and/or discrete values.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ordinals {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<OrdinalRange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrete: Vec<i32>,
}

impl Ordinals {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.discrete.is_empty()
    }
}

/// An inclusive range of ordinals. `end` must not be smaller than `start`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdinalRange {
    pub start: i32,
    pub end: i32,
}

/// A role an instance can take.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    pub name: String,

    /// Whether members of this role count towards the quorum of the product.
    #[serde(default)]
    pub participates_in_quorum: bool,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum MemberUpdateStrategy {
    /// Replace one instance at a time, in role priority order.
    #[default]
    Serial,

    /// Replace all outdated instances at once.
    Parallel,

    /// Replace non-quorum instances first, then followers in two halves and the leader last.
    BestEffortParallel,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// The number of created instances.
    #[serde(default)]
    pub replicas: i32,

    /// The number of instances with a `Ready` condition and a matching image.
    #[serde(default)]
    pub ready_replicas: i32,

    /// The number of instances which have been ready for at least `minReadySeconds`.
    #[serde(default)]
    pub available_replicas: i32,

    /// The number of instances running the update revision.
    #[serde(default)]
    pub updated_replicas: i32,

    /// The number of instances running their current revision.
    #[serde(default)]
    pub current_replicas: i32,

    /// The revision instances are updated to, unless `updateRevisions` has an entry for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    /// Per instance update revisions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub update_revisions: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    /// Per instance revisions recorded before the running update began.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub current_revisions: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates_status: Vec<InstanceTemplateStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_status: Vec<MemberStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<InstanceSetCondition>,
}

impl InstanceSetStatus {
    /// The revision the given instance should run.
    pub fn update_revision_of(&self, instance: &str) -> Option<&str> {
        self.update_revisions
            .get(instance)
            .or(self.update_revision.as_ref())
            .map(String::as_str)
    }

    /// The revision the given instance ran before the current update began.
    pub fn current_revision_of(&self, instance: &str) -> Option<&str> {
        self.current_revisions
            .get(instance)
            .or(self.current_revision.as_ref())
            .map(String::as_str)
    }
}

/// Replica counters of a single named template.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplateStatus {
    pub name: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub updated_replicas: i32,

    #[serde(default)]
    pub current_replicas: i32,
}

/// The role an instance was last seen with.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub pod_name: String,
    pub role: String,

    #[serde(default)]
    pub ready: bool,
}

impl InstanceSet {
    pub fn status_or_default(&self) -> std::borrow::Cow<'_, InstanceSetStatus> {
        self.status
            .as_ref()
            .map_or_else(std::borrow::Cow::default, std::borrow::Cow::Borrowed)
    }
}
