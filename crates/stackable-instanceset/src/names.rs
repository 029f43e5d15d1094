//! Resolution of instance names and ordinals.
//!
//! Every instance of an [`InstanceSet`] has a stable name of the form
//! `<parent>[-<templateName>]-<ordinal>`. The default (unnamed) template omits the middle segment,
//! so with a parent named `kafka` and a template named `broker` the names look like this:
//!
//! * `kafka-0`, `kafka-1` (default template)
//! * `kafka-broker-0`, `kafka-broker-1` (template `broker`)
//!
//! [`parse_parent_name_and_ordinal`] is the inverse of [`build_instance_name`]: it splits the name
//! at the last `-` into the parent part (`kafka-broker`) and the ordinal (`1`). Both functions must
//! be kept symmetric, as names are parsed again when instances are sorted.
//!
//! Ordinals of a template are either given explicitly via [`Ordinals`], or handed out from `0`
//! upwards. In both cases names listed in [`InstanceSetSpec::offline_instances`] are never
//! handed out again.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::ResourceExt;
use snafu::{OptionExt, Snafu, ensure};

#[cfg(doc)]
use crate::crd::InstanceSetSpec;
use crate::{
    crd::{InstanceSet, InstanceTemplate, Ordinals, TEMPLATE_NAME_LABEL_KEY},
    utils::sort::sort_names,
};

/// The name of the implicit default template.
pub const DEFAULT_TEMPLATE_NAME: &str = "";

pub type Result<T, E = PlanValidationError> = std::result::Result<T, E>;

/// The spec of an [`InstanceSet`] is internally inconsistent. These errors are fatal to the
/// current reconciliation and need a spec change to be resolved.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum PlanValidationError {
    #[snafu(display("range's end ({end}) must be greater than or equal to its start ({start})"))]
    InvalidOrdinalRange { start: i32, end: i32 },

    #[snafu(display("ordinal {ordinal} is invalid, ordinals must not be negative"))]
    NegativeOrdinal { ordinal: i32 },

    #[snafu(display("template '{template}' requests a negative amount of replicas ({replicas})"))]
    NegativeReplicas { template: String, replicas: i32 },

    #[snafu(display(
        "for template '{template}', expected {expected} instance names but generated {}: [{}]",
        generated.len(),
        generated.join(", ")
    ))]
    ReplicasMismatch {
        template: String,
        expected: usize,
        generated: Vec<String>,
    },

    #[snafu(display("duplicate instance template name '{name}'"))]
    DuplicateTemplateName { name: String },

    #[snafu(display("duplicate instance name '{name}'"))]
    DuplicateInstanceName { name: String },

    #[snafu(display(
        "total replicas of instance templates ({total}) should not be greater than replicas in spec ({replicas})"
    ))]
    TemplateReplicasExceeded { total: i64, replicas: i32 },

    #[snafu(display("template {name} not found"))]
    TemplateNotFound { name: String },
}

impl Ordinals {
    /// Resolves the ranges and discrete values into a deduplicated, ascending list.
    pub fn to_sorted_list(&self) -> Result<Vec<i32>> {
        let mut ordinals = BTreeSet::new();

        for range in &self.ranges {
            ensure!(range.start <= range.end, InvalidOrdinalRangeSnafu {
                start: range.start,
                end: range.end
            });
            ensure!(range.start >= 0, NegativeOrdinalSnafu {
                ordinal: range.start
            });
            ordinals.extend(range.start..=range.end);
        }

        for &ordinal in &self.discrete {
            ensure!(ordinal >= 0, NegativeOrdinalSnafu { ordinal });
            ordinals.insert(ordinal);
        }

        Ok(ordinals.into_iter().collect())
    }
}

/// Builds the name of an instance, see the [module documentation](self).
pub fn build_instance_name(parent: &str, template: &str, ordinal: i32) -> String {
    if template.is_empty() {
        format!("{parent}-{ordinal}")
    } else {
        format!("{parent}-{template}-{ordinal}")
    }
}

/// Splits an instance name into its parent part and ordinal.
///
/// Returns the full name and [`None`] if the name has no parsable ordinal suffix.
pub fn parse_parent_name_and_ordinal(name: &str) -> (&str, Option<i32>) {
    let Some((parent, suffix)) = name.rsplit_once('-') else {
        return (name, None);
    };

    // Non-canonical suffixes such as `+1` or `01` would not round-trip through
    // build_instance_name
    match suffix.parse::<i32>() {
        Ok(ordinal) if ordinal >= 0 && ordinal.to_string() == suffix => (parent, Some(ordinal)),
        _ => (name, None),
    }
}

/// Generates the names of a single template.
///
/// With a non-empty `ordinals` list only these ordinals are used, surplus ordinals are simply not
/// used. Without ordinals the names are handed out from `0` upwards, skipping every name in
/// `taken`. In both cases names in `offline` are skipped.
pub fn generate_instance_names_from_template(
    parent: &str,
    template: &str,
    replicas: i32,
    offline: &BTreeSet<&str>,
    taken: &BTreeSet<String>,
    ordinals: &[i32],
) -> Result<Vec<String>> {
    let expected = usize::try_from(replicas).ok().context(NegativeReplicasSnafu {
        template,
        replicas,
    })?;

    if !ordinals.is_empty() {
        return generate_instance_names_with_ordinals(parent, template, expected, offline, ordinals);
    }

    let mut names = Vec::new();
    let mut ordinal = 0;
    while names.len() < expected {
        let name = build_instance_name(parent, template, ordinal);
        ordinal += 1;
        if offline.contains(name.as_str()) || taken.contains(&name) {
            continue;
        }
        names.push(name);
    }

    Ok(names)
}

fn generate_instance_names_with_ordinals(
    parent: &str,
    template: &str,
    expected: usize,
    offline: &BTreeSet<&str>,
    ordinals: &[i32],
) -> Result<Vec<String>> {
    let mut ordinals = ordinals.to_vec();
    ordinals.sort_unstable();

    let generated: Vec<String> = ordinals
        .into_iter()
        .map(|ordinal| build_instance_name(parent, template, ordinal))
        .filter(|name| !offline.contains(name.as_str()))
        .take(expected)
        .collect();

    ensure!(generated.len() == expected, ReplicasMismatchSnafu {
        template,
        expected,
        generated
    });

    Ok(generated)
}

/// Generates the names of all instances: first the names of the named `templates` (in order),
/// then the names of the default template which receives the replicas not covered by the named
/// templates.
///
/// The result is sorted by parent name and ordinal.
pub fn generate_all_instance_names(
    parent: &str,
    replicas: i32,
    templates: &[InstanceTemplate],
    offline_instances: &[String],
    default_template_ordinals: &Ordinals,
) -> Result<Vec<String>> {
    let offline: BTreeSet<&str> = offline_instances.iter().map(String::as_str).collect();
    let mut taken = BTreeSet::new();
    let mut all_names = Vec::new();

    let total = total_template_replicas(templates, replicas)?;

    let mut template_names = BTreeSet::new();
    for template in templates {
        ensure!(
            template_names.insert(template.name.as_str()),
            DuplicateTemplateNameSnafu {
                name: &template.name
            }
        );

        let ordinals = template.ordinals.to_sorted_list()?;
        let names = generate_instance_names_from_template(
            parent,
            &template.name,
            template.replicas(),
            &offline,
            &taken,
            &ordinals,
        )?;
        taken.extend(names.iter().cloned());
        all_names.extend(names);
    }

    if let Some(remaining) = remaining_replicas(replicas, total) {
        let ordinals = default_template_ordinals.to_sorted_list()?;
        let names = generate_instance_names_from_template(
            parent,
            DEFAULT_TEMPLATE_NAME,
            remaining,
            &offline,
            &taken,
            &ordinals,
        )?;
        all_names.extend(names);
    }

    validate_dup_instance_names(&all_names, String::as_str)?;
    sort_names(&mut all_names);

    Ok(all_names)
}

/// Sums up the replicas of the named templates, which must not exceed `replicas`.
fn total_template_replicas(templates: &[InstanceTemplate], replicas: i32) -> Result<i64> {
    let total = templates.iter().try_fold(0_i64, |total, template| -> Result<i64> {
        let template_replicas = template.replicas();
        ensure!(template_replicas >= 0, NegativeReplicasSnafu {
            template: &template.name,
            replicas: template_replicas
        });
        Ok(total + i64::from(template_replicas))
    })?;

    ensure!(total <= i64::from(replicas), TemplateReplicasExceededSnafu {
        total,
        replicas
    });
    Ok(total)
}

/// The replicas left for the default template, if any.
fn remaining_replicas(replicas: i32, total: i64) -> Option<i32> {
    i32::try_from(i64::from(replicas) - total)
        .ok()
        .filter(|remaining| *remaining > 0)
}

/// Makes sure no name is returned twice by `name_of`.
pub fn validate_dup_instance_names<T>(items: &[T], name_of: impl Fn(&T) -> &str) -> Result<()> {
    let mut seen = BTreeSet::new();
    for item in items {
        let name = name_of(item);
        ensure!(seen.insert(name), DuplicateInstanceNameSnafu { name });
    }
    Ok(())
}

/// An [`InstanceTemplate`] with all defaults resolved and its overrides applied to the default
/// Pod template of the [`InstanceSet`].
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceTemplateExt {
    pub name: String,
    pub replicas: i32,
    pub ordinals: Ordinals,
    pub pod_template: PodTemplateSpec,
}

/// Expands the templates of an [`InstanceSet`]: the named templates in declaration order,
/// followed by the implicit default template if the named templates don't cover all replicas.
pub fn build_instance_templates(its: &InstanceSet) -> Result<Vec<InstanceTemplateExt>> {
    let total = total_template_replicas(&its.spec.instances, its.spec.replicas)?;

    let mut templates: Vec<InstanceTemplateExt> = its
        .spec
        .instances
        .iter()
        .map(|template| InstanceTemplateExt {
            name: template.name.clone(),
            replicas: template.replicas(),
            ordinals: template.ordinals.clone(),
            pod_template: merge_template_overrides(&its.spec.template, template),
        })
        .collect();

    if let Some(remaining) = remaining_replicas(its.spec.replicas, total) {
        templates.push(InstanceTemplateExt {
            name: DEFAULT_TEMPLATE_NAME.to_owned(),
            replicas: remaining,
            ordinals: its.spec.default_template_ordinals.clone(),
            pod_template: its.spec.template.clone(),
        });
    }

    Ok(templates)
}

fn merge_template_overrides(base: &PodTemplateSpec, template: &InstanceTemplate) -> PodTemplateSpec {
    let mut pod_template = base.clone();
    let metadata = pod_template.metadata.get_or_insert_with(Default::default);

    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(template.labels.clone());
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(TEMPLATE_NAME_LABEL_KEY.to_owned(), template.name.clone());

    if !template.annotations.is_empty() {
        metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(template.annotations.clone());
    }

    if let Some(image) = &template.image {
        if let Some(container) = pod_template
            .spec
            .as_mut()
            .and_then(|spec| spec.containers.first_mut())
        {
            container.image = Some(image.clone());
        }
    }

    pod_template
}

/// Maps every instance name of the [`InstanceSet`] to the template it is created from.
pub fn build_instance_name_to_template_map(
    its: &InstanceSet,
) -> Result<BTreeMap<String, InstanceTemplateExt>> {
    let parent = its.name_any();
    let offline: BTreeSet<&str> = its
        .spec
        .offline_instances
        .iter()
        .map(String::as_str)
        .collect();

    let templates = build_instance_templates(its)?;
    let mut taken = BTreeSet::new();
    let mut name_to_template = BTreeMap::new();

    let mut template_names = BTreeSet::new();
    for template in templates {
        ensure!(
            template_names.insert(template.name.clone()),
            DuplicateTemplateNameSnafu {
                name: &template.name
            }
        );

        let ordinals = template.ordinals.to_sorted_list()?;
        let names = generate_instance_names_from_template(
            &parent,
            &template.name,
            template.replicas,
            &offline,
            &taken,
            &ordinals,
        )?;

        for name in names {
            ensure!(
                !name_to_template.contains_key(&name),
                DuplicateInstanceNameSnafu { name }
            );
            taken.insert(name.clone());
            name_to_template.insert(name, template.clone());
        }
    }

    Ok(name_to_template)
}

/// Returns the configured ordinals of the template with the given name. The default template is
/// addressed with [`DEFAULT_TEMPLATE_NAME`].
pub fn ordinals_for_template<'a>(its: &'a InstanceSet, template: &str) -> Result<&'a Ordinals> {
    if template == DEFAULT_TEMPLATE_NAME {
        return Ok(&its.spec.default_template_ordinals);
    }

    its.spec
        .instances
        .iter()
        .find(|instance| instance.name == template)
        .map(|instance| &instance.ordinals)
        .context(TemplateNotFoundSnafu { name: template })
}

/// Like [`ordinals_for_template`], but resolved to a sorted list.
pub fn ordinal_list_for_template(its: &InstanceSet, template: &str) -> Result<Vec<i32>> {
    ordinals_for_template(its, template)?.to_sorted_list()
}

/// Validates that the names of the [`InstanceSet`] can be resolved.
pub fn validate_spec(its: &InstanceSet) -> Result<()> {
    build_instance_name_to_template_map(its).map(|_| ())
}
