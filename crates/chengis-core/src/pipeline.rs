//! Pipeline definition tree.
//!
//! A pipeline is an ordered list of stages; each stage carries sequential or
//! parallel steps, an optional container binding, an optional `when`
//! condition, an optional approval gate, and post blocks. The pipeline itself
//! has an outer post block, artifact patterns, notify targets, and an
//! optional matrix strategy that fans stages out over axis combinations.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A pipeline definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (usually the job name).
    pub name: String,
    /// Ordered top-level stages.
    pub stages: Vec<Stage>,
    /// Pipeline-level post block, run against the aggregate status.
    #[serde(default)]
    pub post: PostBlock,
    /// Glob patterns for artifact collection.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Notification targets.
    #[serde(default)]
    pub notify: Vec<String>,
    /// Optional matrix strategy.
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    /// Global environment variables.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A stage in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// Steps to run.
    #[serde(default)]
    pub steps: Vec<StepDef>,
    /// Run steps concurrently instead of in order.
    #[serde(default)]
    pub parallel: bool,
    /// Optional container binding for all steps in this stage.
    #[serde(default)]
    pub container: Option<ContainerBinding>,
    /// Conditional execution.
    #[serde(default)]
    pub when: Option<WhenCondition>,
    /// Approval gate blocking the stage until resolved.
    #[serde(default)]
    pub approval: Option<ApprovalSpec>,
    /// Stage-level post block.
    #[serde(default)]
    pub post: PostBlock,
    /// Stage-specific environment variables.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Stage {
    /// Whether this stage is an approval gate.
    pub fn is_gate(&self) -> bool {
        self.approval.is_some()
    }
}

/// The atomic executable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name.
    pub name: String,
    /// Which executor runs this step.
    #[serde(default)]
    pub kind: StepKind,
    /// Command or action (shell command line, IaC action, compose service).
    pub command: String,
    /// Container image for docker steps.
    #[serde(default)]
    pub image: Option<String>,
    /// Image pull policy for docker steps.
    #[serde(default)]
    pub pull_policy: Option<PullPolicy>,
    /// Step-specific environment variables.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Working directory relative to the workspace.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Timeout in seconds; the caller supplies a default when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Step kinds understood by the executor registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    #[default]
    Shell,
    Docker,
    DockerCompose,
    Terraform,
    Pulumi,
    Cloudformation,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Shell => "shell",
            StepKind::Docker => "docker",
            StepKind::DockerCompose => "docker-compose",
            StepKind::Terraform => "terraform",
            StepKind::Pulumi => "pulumi",
            StepKind::Cloudformation => "cloudformation",
        }
    }
}

/// Container binding for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerBinding {
    pub image: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
}

/// Branch/parameter predicate gating stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhenCondition {
    /// Branch equals the given name, or matches a trailing-`*` prefix pattern.
    Branch { pattern: String },
    /// A build parameter equals the given value.
    ParameterEquals { name: String, value: String },
    Not { condition: Box<WhenCondition> },
    AllOf { conditions: Vec<WhenCondition> },
    AnyOf { conditions: Vec<WhenCondition> },
}

impl WhenCondition {
    /// Evaluate against the build's branch and parameter bindings.
    pub fn evaluate(&self, branch: &str, parameters: &HashMap<String, String>) -> bool {
        match self {
            WhenCondition::Branch { pattern } => {
                if let Some(prefix) = pattern.strip_suffix('*') {
                    branch.starts_with(prefix)
                } else {
                    branch == pattern
                }
            }
            WhenCondition::ParameterEquals { name, value } => {
                parameters.get(name).is_some_and(|v| v == value)
            }
            WhenCondition::Not { condition } => !condition.evaluate(branch, parameters),
            WhenCondition::AllOf { conditions } => {
                conditions.iter().all(|c| c.evaluate(branch, parameters))
            }
            WhenCondition::AnyOf { conditions } => {
                conditions.iter().any(|c| c.evaluate(branch, parameters))
            }
        }
    }
}

/// Approval gate attached to a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSpec {
    /// Role required to respond.
    pub required_role: String,
    /// Minimum approving responses.
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    /// Seconds before the gate times out and fails the build.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

fn default_min_approvals() -> u32 {
    1
}

fn default_approval_timeout() -> u64 {
    24 * 60 * 60
}

/// Post hooks attached to a stage or pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostBlock {
    #[serde(default)]
    pub always: Vec<StepDef>,
    #[serde(default)]
    pub on_success: Vec<StepDef>,
    #[serde(default)]
    pub on_failure: Vec<StepDef>,
}

impl PostBlock {
    pub fn is_empty(&self) -> bool {
        self.always.is_empty() && self.on_success.is_empty() && self.on_failure.is_empty()
    }
}

/// Matrix strategy: axis name to values, with excluded combinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Axis name to list of values. Insertion order is expansion order.
    pub axes: IndexMap<String, Vec<String>>,
    /// Excluded combinations, each a full or partial axis binding.
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_condition_exact_and_prefix() {
        let exact = WhenCondition::Branch {
            pattern: "main".to_string(),
        };
        assert!(exact.evaluate("main", &HashMap::new()));
        assert!(!exact.evaluate("develop", &HashMap::new()));

        let prefix = WhenCondition::Branch {
            pattern: "release/*".to_string(),
        };
        assert!(prefix.evaluate("release/1.2", &HashMap::new()));
        assert!(!prefix.evaluate("feature/x", &HashMap::new()));
    }

    #[test]
    fn parameter_condition() {
        let cond = WhenCondition::ParameterEquals {
            name: "deploy".to_string(),
            value: "true".to_string(),
        };
        let mut params = HashMap::new();
        assert!(!cond.evaluate("main", &params));
        params.insert("deploy".to_string(), "true".to_string());
        assert!(cond.evaluate("main", &params));
    }

    #[test]
    fn composite_conditions() {
        let cond = WhenCondition::AllOf {
            conditions: vec![
                WhenCondition::Branch {
                    pattern: "main".to_string(),
                },
                WhenCondition::Not {
                    condition: Box::new(WhenCondition::ParameterEquals {
                        name: "skip".to_string(),
                        value: "true".to_string(),
                    }),
                },
            ],
        };
        assert!(cond.evaluate("main", &HashMap::new()));
        let mut params = HashMap::new();
        params.insert("skip".to_string(), "true".to_string());
        assert!(!cond.evaluate("main", &params));
    }

    #[test]
    fn pipeline_round_trips_through_json() {
        let json = r#"{
            "name": "demo",
            "stages": [
                {"name": "build", "steps": [{"name": "compile", "command": "make"}]},
                {"name": "deploy", "steps": [], "approval": {"required_role": "admin"}}
            ]
        }"#;
        let pipeline: Pipeline = serde_json::from_str(json).unwrap();
        assert_eq!(pipeline.stages.len(), 2);
        assert!(!pipeline.stages[0].is_gate());
        assert!(pipeline.stages[1].is_gate());
        assert_eq!(pipeline.stages[1].approval.as_ref().unwrap().min_approvals, 1);
    }
}
