//! The pipeline value.
//!
//! This is the canonical in-memory and on-disk pipeline representation. Every
//! on-disk format (YAML workflow, server-side definition) converts into this
//! tree; the orchestration core only ever sees values of these types.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A complete pipeline definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Global environment variables, inherited by every step.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Pipeline-level container, propagated to stages without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    /// Pipeline-level matrix, propagated to stages without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix>,
    #[serde(default)]
    pub parameters: Vec<ParamDef>,
    pub stages: Vec<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<PostActions>,
    /// Glob patterns collected from the workspace after the stage loop.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub notify: Vec<NotifierConfig>,
    #[serde(default)]
    pub cache: Vec<CacheDecl>,
}

/// A stage: a sequence (or parallel group) of steps forming a unit of
/// dependency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Run this stage's steps concurrently instead of in order.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix>,
    #[serde(default)]
    pub cache: Vec<CacheDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    pub steps: Vec<Step>,
}

/// A single command produced by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory relative to the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    #[default]
    Shell,
    Docker,
    DockerCompose,
}

/// Conditional execution of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Expected value (branch name, or parameter value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Parameter name for `param` conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionKind {
    Branch,
    Param,
}

/// Dependency/artifact cache declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDecl {
    pub key: String,
    pub paths: Vec<String>,
    /// Key prefixes tried in declared order when the exact key misses.
    #[serde(rename = "restore-keys", default)]
    pub restore_keys: Vec<String>,
}

/// Container context for stages and steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub image: String,
    /// Bind mounts, `host:container` form.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Named volumes that persist across runs on the same host.
    #[serde(rename = "cache-volumes", default)]
    pub cache_volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Matrix of parameter axes. Axis order is not significant; expanded stage
/// names list axes in ascending lexical order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Matrix {
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub axes: BTreeMap<String, Vec<String>>,
}

/// Approval gate configuration on a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub required_approvals: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
}

/// Steps run after the stage loop regardless of how it went.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostActions {
    #[serde(default)]
    pub always: Vec<Step>,
    #[serde(rename = "on-success", default)]
    pub on_success: Vec<Step>,
    #[serde(rename = "on-failure", default)]
    pub on_failure: Vec<Step>,
}

/// A parameter declared by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Notification sink configuration, interpreted by the host's notifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl Step {
    /// Shorthand used by tests and server-side pipeline builders.
    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: StepType::Shell,
            command: command.into(),
            image: None,
            env: HashMap::new(),
            dir: None,
            timeout_ms: None,
            condition: None,
        }
    }
}

impl Stage {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Default::default()
        }
    }
}

impl Pipeline {
    /// Structural validation: non-empty stages, unique stage names, every
    /// step named, conditions well-formed.
    pub fn validate(&self) -> crate::Result<()> {
        if self.stages.is_empty() {
            return Err(crate::Error::PipelineInvalid("pipeline has no stages".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(crate::Error::PipelineInvalid("stage with empty name".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(crate::Error::PipelineInvalid(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if stage.steps.is_empty() && stage.approval.is_none() {
                return Err(crate::Error::PipelineInvalid(format!(
                    "stage {} has no steps",
                    stage.name
                )));
            }
            for step in &stage.steps {
                if step.name.trim().is_empty() {
                    return Err(crate::Error::PipelineInvalid(format!(
                        "unnamed step in stage {}",
                        stage.name
                    )));
                }
                if let Some(cond) = &step.condition {
                    if cond.kind == ConditionKind::Param && cond.param.is_none() {
                        return Err(crate::Error::PipelineInvalid(format!(
                            "param condition without param name in step {}",
                            step.name
                        )));
                    }
                }
                if matches!(step.step_type, StepType::Docker) && step.image.is_none() {
                    return Err(crate::Error::PipelineInvalid(format!(
                        "docker step {} has no image",
                        step.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_duplicate_stage_names() {
        let pipeline = Pipeline {
            stages: vec![
                Stage::new("Build", vec![Step::shell("c", "echo ok")]),
                Stage::new("Build", vec![Step::shell("c", "echo ok")]),
            ],
            ..Default::default()
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn validate_rejects_docker_step_without_image() {
        let mut step = Step::shell("c", "make");
        step.step_type = StepType::Docker;
        let pipeline = Pipeline {
            stages: vec![Stage::new("Build", vec![step])],
            ..Default::default()
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn matrix_deserializes_axes_and_exclusions() {
        let json = serde_json::json!({
            "os": ["linux", "macos"],
            "jdk": ["11", "17"],
            "exclude": [{"os": "macos", "jdk": "11"}]
        });
        let matrix: Matrix = serde_json::from_value(json).unwrap();
        assert_eq!(matrix.axes.len(), 2);
        assert_eq!(matrix.exclude.len(), 1);
    }

    #[test]
    fn post_actions_use_kebab_keys() {
        let json = serde_json::json!({
            "always": [],
            "on-success": [{"name": "s", "command": "echo done"}],
            "on-failure": []
        });
        let post: PostActions = serde_json::from_value(json).unwrap();
        assert_eq!(post.on_success.len(), 1);
    }
}
