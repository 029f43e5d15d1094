use jiff::Timestamp;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount};

/// A **data structure** that produces a [`ConditionSet`] containing all conditions it can
/// make a statement about.
pub trait ConditionBuilder {
    fn build_conditions(&self) -> ConditionSet;
}

/// Computes the conditions to be stored in the status of an InstanceSet.
///
/// Conditions present in `new_conditions` replace the previous condition of the same type,
/// conditions absent from `new_conditions` are removed. The transition time of a condition only
/// moves to `now` if its status changed.
pub fn compute_conditions(
    previous: &[InstanceSetCondition],
    builder: &dyn ConditionBuilder,
    now: Timestamp,
) -> Vec<InstanceSetCondition> {
    let previous: ConditionSet = previous.to_vec().into();
    let new_conditions = builder.build_conditions();

    let mut result = ConditionSet::new();
    for (old, new) in previous.conditions.into_iter().zip(new_conditions.conditions) {
        if let Some(new) = new {
            result.put(update_timestamps(old, new, now));
        }
    }

    result.into()
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetCondition {
    /// Last time the condition transitioned from one status to another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// A human readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,

    #[serde(rename = "type")]
    pub type_: InstanceSetConditionType,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumCount,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum InstanceSetConditionType {
    /// All desired instances exist, are ready and run the requested images.
    #[default]
    InstanceReady,

    /// All desired instances have been ready for at least `minReadySeconds`.
    InstanceAvailable,

    /// At least one instance failed. Only present while there are failed instances.
    InstanceFailure,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// True means a resource is in the condition.
    #[default]
    True,
    /// False means a resource is not in the condition.
    False,
    /// Unknown means kubernetes cannot decide if a resource is in the condition or not.
    Unknown,
}

/// Helper struct to order conditions: every [`InstanceSetConditionType`] has a fixed position.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionSet {
    conditions: Vec<Option<InstanceSetCondition>>,
}

impl Default for ConditionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionSet {
    pub fn new() -> Self {
        Self {
            conditions: vec![None; InstanceSetConditionType::COUNT],
        }
    }

    /// Adds a [`InstanceSetCondition`] to its assigned index, replacing any condition of the
    /// same type.
    pub fn put(&mut self, condition: InstanceSetCondition) {
        let index = condition.type_ as usize;
        self.conditions[index] = Some(condition);
    }

    pub fn get(&self, type_: InstanceSetConditionType) -> Option<&InstanceSetCondition> {
        self.conditions[type_ as usize].as_ref()
    }
}

/// Keeps the transition time of the old condition if the status did not change.
fn update_timestamps(
    old_condition: Option<InstanceSetCondition>,
    new_condition: InstanceSetCondition,
    now: Timestamp,
) -> InstanceSetCondition {
    match old_condition {
        Some(old) if old.status == new_condition.status && old.last_transition_time.is_some() => {
            InstanceSetCondition {
                last_transition_time: old.last_transition_time,
                ..new_condition
            }
        }
        _ => InstanceSetCondition {
            last_transition_time: Some(Time(now)),
            ..new_condition
        },
    }
}

impl From<ConditionSet> for Vec<InstanceSetCondition> {
    fn from(value: ConditionSet) -> Self {
        value.conditions.into_iter().flatten().collect()
    }
}

impl From<Vec<InstanceSetCondition>> for ConditionSet {
    fn from(value: Vec<InstanceSetCondition>) -> Self {
        let mut result = Self::new();
        for c in value {
            result.put(c);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use jiff::SignedDuration;

    use super::*;

    struct FixedConditions(Vec<InstanceSetCondition>);

    impl ConditionBuilder for FixedConditions {
        fn build_conditions(&self) -> ConditionSet {
            self.0.clone().into()
        }
    }

    fn condition(type_: InstanceSetConditionType, status: ConditionStatus) -> InstanceSetCondition {
        InstanceSetCondition {
            type_,
            status,
            ..InstanceSetCondition::default()
        }
    }

    fn now() -> Timestamp {
        "2024-05-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn conditions_have_fixed_order() {
        let builder = FixedConditions(vec![
            condition(InstanceSetConditionType::InstanceFailure, ConditionStatus::True),
            condition(InstanceSetConditionType::InstanceAvailable, ConditionStatus::False),
            condition(InstanceSetConditionType::InstanceReady, ConditionStatus::False),
        ]);

        let got = compute_conditions(&[], &builder, now());

        let types: Vec<_> = got.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![
            InstanceSetConditionType::InstanceReady,
            InstanceSetConditionType::InstanceAvailable,
            InstanceSetConditionType::InstanceFailure,
        ]);
        assert!(
            got.iter()
                .all(|c| c.last_transition_time == Some(Time(now())))
        );
    }

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let earlier = now() - SignedDuration::from_secs(60);
        let previous = vec![
            InstanceSetCondition {
                last_transition_time: Some(Time(earlier)),
                ..condition(InstanceSetConditionType::InstanceReady, ConditionStatus::True)
            },
            InstanceSetCondition {
                last_transition_time: Some(Time(earlier)),
                ..condition(InstanceSetConditionType::InstanceAvailable, ConditionStatus::True)
            },
        ];
        let builder = FixedConditions(vec![
            InstanceSetCondition {
                reason: Some("Ready".to_owned()),
                ..condition(InstanceSetConditionType::InstanceReady, ConditionStatus::True)
            },
            condition(InstanceSetConditionType::InstanceAvailable, ConditionStatus::False),
        ]);

        let got: ConditionSet = compute_conditions(&previous, &builder, now()).into();

        let ready = got.get(InstanceSetConditionType::InstanceReady).unwrap();
        assert_eq!(ready.last_transition_time, Some(Time(earlier)));
        assert_eq!(ready.reason.as_deref(), Some("Ready"));

        let available = got.get(InstanceSetConditionType::InstanceAvailable).unwrap();
        assert_eq!(available.last_transition_time, Some(Time(now())));
        assert_eq!(available.status, ConditionStatus::False);
    }

    #[test]
    fn absent_conditions_are_removed() {
        let previous = vec![condition(
            InstanceSetConditionType::InstanceFailure,
            ConditionStatus::True,
        )];

        let got = compute_conditions(&previous, &FixedConditions(vec![]), now());

        assert!(got.is_empty());
    }

    #[test]
    fn serialize_condition_type() {
        let condition = condition(InstanceSetConditionType::InstanceAvailable, ConditionStatus::False);
        let json = serde_json::to_value(&condition).unwrap();

        assert_eq!(json["type"], "InstanceAvailable");
        assert_eq!(json["status"], "False");
    }
}
