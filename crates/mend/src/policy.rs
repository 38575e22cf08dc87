//! Remediation policy: ordered classification-to-action rules.
//!
//! A policy is data, not code. "Flask-app-specific" versus "generic
//! pending pods" behavior is expressed as different rule lists passed to
//! the same reconciler.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::HealthState;
use crate::workload::ResourceSpec;

/// Corrective actions the reconciler knows how to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemediationAction {
    /// Step the workload's resource requests/limits down toward the
    /// configured floor.
    ReduceResourceFootprint,
    /// Delete non-Running pods so the orchestrator recreates them.
    ForceReschedule,
    /// Invoke the external image rebuild hook.
    RebuildAndReload,
    /// Flip the named companion Service to NodePort exposure.
    ExposeExternally { service: String },
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReduceResourceFootprint => f.write_str("reduce-resource-footprint"),
            Self::ForceReschedule => f.write_str("force-reschedule"),
            Self::RebuildAndReload => f.write_str("rebuild-and-reload"),
            Self::ExposeExternally { service } => write!(f, "expose-externally({service})"),
        }
    }
}

/// One classification-to-action rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Classification this rule fires on.
    pub on: HealthState,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub action: RemediationAction,
}

/// Resource reduction step configuration.
///
/// The floors exist so the reconciler never re-patches identical values:
/// once a deployment's spec sits at the floor, the reduce action is a
/// no-op and rule selection moves past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceReduction {
    /// Each step divides current values by this (minimum 1 change per step
    /// is not guaranteed; the floor clamp is).
    pub divisor: u64,
    pub cpu_request_floor_millis: u64,
    pub memory_request_floor_mebibytes: u64,
    pub cpu_limit_floor_millis: u64,
    pub memory_limit_floor_mebibytes: u64,
}

impl Default for ResourceReduction {
    fn default() -> Self {
        Self {
            divisor: 2,
            cpu_request_floor_millis: 25,
            memory_request_floor_mebibytes: 32,
            cpu_limit_floor_millis: 100,
            memory_limit_floor_mebibytes: 128,
        }
    }
}

impl ResourceReduction {
    /// Compute the next step down from `current`. Declared fields move
    /// toward the floor; undeclared fields are set to the floor outright.
    pub fn reduce(&self, current: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu_request_millis: Some(self.step(
                current.cpu_request_millis,
                self.cpu_request_floor_millis,
            )),
            memory_request_mebibytes: Some(self.step(
                current.memory_request_mebibytes,
                self.memory_request_floor_mebibytes,
            )),
            cpu_limit_millis: Some(self.step(current.cpu_limit_millis, self.cpu_limit_floor_millis)),
            memory_limit_mebibytes: Some(self.step(
                current.memory_limit_mebibytes,
                self.memory_limit_floor_mebibytes,
            )),
        }
    }

    fn step(&self, current: Option<u64>, floor: u64) -> u64 {
        match current {
            Some(value) => (value / self.divisor.max(1)).max(floor),
            None => floor,
        }
    }

    /// True once every field sits at its floor; reducing further would be
    /// a no-op patch.
    pub fn at_floor(&self, spec: &ResourceSpec) -> bool {
        spec.cpu_request_millis == Some(self.cpu_request_floor_millis)
            && spec.memory_request_mebibytes == Some(self.memory_request_floor_mebibytes)
            && spec.cpu_limit_millis == Some(self.cpu_limit_floor_millis)
            && spec.memory_limit_mebibytes == Some(self.memory_limit_floor_mebibytes)
    }
}

/// Ordered remediation policy plus resource step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub resources: ResourceReduction,
}

/// Errors loading or validating a policy file.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("policy declares no rules")]
    EmptyRules,

    #[error("resource reduction divisor must be at least 1")]
    ZeroDivisor,
}

impl Policy {
    /// The built-in policy, mirroring the remediation order of the fix
    /// scripts this tool replaces: try a resource step-down before blind
    /// pod deletion, rebuild on image errors, reschedule generic pending.
    pub fn default_policy() -> Self {
        Self {
            rules: vec![
                PolicyRule {
                    on: HealthState::ResourceStarved,
                    action: RemediationAction::ReduceResourceFootprint,
                },
                PolicyRule {
                    on: HealthState::ResourceStarved,
                    action: RemediationAction::ForceReschedule,
                },
                PolicyRule {
                    on: HealthState::ImageError,
                    action: RemediationAction::RebuildAndReload,
                },
                PolicyRule {
                    on: HealthState::Pending,
                    action: RemediationAction::ForceReschedule,
                },
            ],
            resources: ResourceReduction::default(),
        }
    }

    /// Load a policy from a YAML file and validate it.
    pub fn from_yaml_file(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let policy: Self = serde_yaml::from_str(&raw).map_err(|source| PolicyError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.rules.is_empty() {
            return Err(PolicyError::EmptyRules);
        }
        if self.resources.divisor == 0 {
            return Err(PolicyError::ZeroDivisor);
        }
        Ok(())
    }

    /// Select the first rule matching `state`. When `reduce_exhausted` is
    /// set (the workload's spec already sits at the floor), reduce rules
    /// are skipped so the next matching rule fires instead of repeating a
    /// no-op patch.
    pub fn select(&self, state: HealthState, reduce_exhausted: bool) -> Option<&RemediationAction> {
        self.rules
            .iter()
            .filter(|rule| rule.on == state)
            .map(|rule| &rule.action)
            .find(|action| {
                !(reduce_exhausted && **action == RemediationAction::ReduceResourceFootprint)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_prefers_resource_reduction_over_deletion() {
        let policy = Policy::default_policy();
        assert_eq!(
            policy.select(HealthState::ResourceStarved, false),
            Some(&RemediationAction::ReduceResourceFootprint)
        );
    }

    #[test]
    fn floor_exhaustion_falls_through_to_reschedule() {
        let policy = Policy::default_policy();
        assert_eq!(
            policy.select(HealthState::ResourceStarved, true),
            Some(&RemediationAction::ForceReschedule)
        );
    }

    #[test]
    fn no_rule_for_unlisted_state() {
        let policy = Policy::default_policy();
        assert_eq!(policy.select(HealthState::Degraded, false), None);
        assert_eq!(policy.select(HealthState::Healthy, false), None);
    }

    #[test]
    fn reduce_halves_and_clamps_at_floor() {
        let reduction = ResourceReduction::default();
        let current = ResourceSpec {
            cpu_request_millis: Some(200),
            memory_request_mebibytes: Some(256),
            cpu_limit_millis: Some(400),
            memory_limit_mebibytes: Some(512),
        };
        let next = reduction.reduce(&current);
        assert_eq!(next.cpu_request_millis, Some(100));
        assert_eq!(next.memory_request_mebibytes, Some(128));
        assert_eq!(next.cpu_limit_millis, Some(200));
        assert_eq!(next.memory_limit_mebibytes, Some(256));

        let near_floor = ResourceSpec {
            cpu_request_millis: Some(30),
            memory_request_mebibytes: Some(40),
            cpu_limit_millis: Some(110),
            memory_limit_mebibytes: Some(130),
        };
        let clamped = reduction.reduce(&near_floor);
        assert_eq!(clamped.cpu_request_millis, Some(25));
        assert_eq!(clamped.memory_request_mebibytes, Some(32));
        assert_eq!(clamped.cpu_limit_millis, Some(100));
        assert_eq!(clamped.memory_limit_mebibytes, Some(128));
        assert!(reduction.at_floor(&clamped));
    }

    #[test]
    fn reduce_fills_undeclared_fields_with_floors() {
        let reduction = ResourceReduction::default();
        let next = reduction.reduce(&ResourceSpec::default());
        assert!(reduction.at_floor(&next));
    }

    #[test]
    fn partial_spec_is_not_at_floor() {
        let reduction = ResourceReduction::default();
        let spec = ResourceSpec {
            cpu_request_millis: Some(25),
            ..Default::default()
        };
        assert!(!reduction.at_floor(&spec));
    }

    #[test]
    fn policy_parses_from_yaml() {
        let yaml = r"
rules:
  - on: resource-starved
    action: reduce-resource-footprint
  - on: image-error
    action: rebuild-and-reload
  - on: degraded
    action:
      expose-externally:
        service: flask-app
resources:
  divisor: 4
  cpu_request_floor_millis: 10
";
        let policy: Policy = serde_yaml::from_str(yaml).expect("valid policy yaml");
        assert_eq!(policy.rules.len(), 3);
        assert_eq!(policy.rules[0].on, HealthState::ResourceStarved);
        assert_eq!(
            policy.rules[2].action,
            RemediationAction::ExposeExternally {
                service: "flask-app".to_string()
            }
        );
        assert_eq!(policy.resources.divisor, 4);
        assert_eq!(policy.resources.cpu_request_floor_millis, 10);
        // Unset reduction fields keep their defaults.
        assert_eq!(policy.resources.memory_request_floor_mebibytes, 32);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_rules_and_zero_divisor() {
        let empty = Policy {
            rules: vec![],
            resources: ResourceReduction::default(),
        };
        assert!(matches!(empty.validate(), Err(PolicyError::EmptyRules)));

        let zero = Policy {
            rules: Policy::default_policy().rules,
            resources: ResourceReduction {
                divisor: 0,
                ..Default::default()
            },
        };
        assert!(matches!(zero.validate(), Err(PolicyError::ZeroDivisor)));
    }
}
