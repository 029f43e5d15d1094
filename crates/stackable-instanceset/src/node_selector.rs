//! One-time node placement of instances.
//!
//! Operations like a node migration ask for an instance to be recreated on a specific node. The
//! request is stored in the [`NODE_SELECTOR_ONCE_ANNOTATION_KEY`] annotation of the InstanceSet as
//! JSON object (`{"<instance>": "<node>"}`). Whoever builds the Pod pins it to the node via a
//! hostname node selector, see [`node_for_instance`]. Once the Pod has been scheduled on that node,
//! [`clear_scheduled_instances`] removes the entry again, so later recreations are free to land
//! anywhere.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::crd::{InstanceSet, NODE_SELECTOR_ONCE_ANNOTATION_KEY};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the {NODE_SELECTOR_ONCE_ANNOTATION_KEY:?} annotation"))]
    ParseAnnotation { source: serde_json::Error },

    #[snafu(display("failed to serialize the {NODE_SELECTOR_ONCE_ANNOTATION_KEY:?} annotation"))]
    SerializeAnnotation { source: serde_json::Error },
}

/// Returns the requested instance → node mapping, empty if the annotation is absent.
pub fn parse_annotation(its: &InstanceSet) -> Result<BTreeMap<String, String>, Error> {
    match its.annotations().get(NODE_SELECTOR_ONCE_ANNOTATION_KEY) {
        Some(value) => serde_json::from_str(value).context(ParseAnnotationSnafu),
        None => Ok(BTreeMap::new()),
    }
}

/// Adds `mapping` to the annotation, replacing the node of instances which are already present.
pub fn merge_annotation(
    its: &mut InstanceSet,
    mapping: impl IntoIterator<Item = (String, String)>,
) -> Result<(), Error> {
    let mut current = parse_annotation(its)?;
    current.extend(mapping);
    write_annotation(its, &current)
}

/// The node the instance should be created on, if any.
pub fn node_for_instance(its: &InstanceSet, instance: &str) -> Result<Option<String>, Error> {
    Ok(parse_annotation(its)?.remove(instance))
}

/// Removes the entries of instances whose Pod runs on the requested node. The annotation is
/// dropped once it is empty. Returns whether the InstanceSet was changed.
pub fn clear_scheduled_instances(its: &mut InstanceSet, pods: &[Pod]) -> Result<bool, Error> {
    let mut mapping = parse_annotation(its)?;
    let before = mapping.len();

    mapping.retain(|instance, node| {
        let scheduled = pods.iter().any(|pod| {
            pod.name_any() == *instance
                && pod
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.node_name.as_deref())
                    == Some(node.as_str())
        });
        if scheduled {
            tracing::debug!(%instance, %node, "instance has been scheduled on requested node");
        }
        !scheduled
    });

    if mapping.len() == before {
        return Ok(false);
    }
    write_annotation(its, &mapping)?;
    Ok(true)
}

fn write_annotation(its: &mut InstanceSet, mapping: &BTreeMap<String, String>) -> Result<(), Error> {
    if mapping.is_empty() {
        its.annotations_mut().remove(NODE_SELECTOR_ONCE_ANNOTATION_KEY);
        return Ok(());
    }

    let value = serde_json::to_string(mapping).context(SerializeAnnotationSnafu)?;
    its.annotations_mut()
        .insert(NODE_SELECTOR_ONCE_ANNOTATION_KEY.to_owned(), value);
    Ok(())
}
