//! Pipeline file formats.
//!
//! Each on-disk format is a converter to the pipeline value, registered with
//! candidate paths relative to the workspace root. Resolution walks the
//! registry in priority order and parses the first file that exists; the
//! orchestration core never cares which format produced the value.

use std::path::Path;
use std::sync::Arc;

use crucible_core::build::PipelineSource;
use crucible_core::pipeline::Pipeline;
use crucible_core::{Error, Result};

/// A converter from one on-disk format to the pipeline value.
pub trait PipelineFormat: Send + Sync {
    fn parse(&self, text: &str) -> Result<Pipeline>;
}

/// A pipeline resolved from the workspace.
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    pub source: PipelineSource,
    pub pipeline: Pipeline,
}

struct Registration {
    source: PipelineSource,
    paths: Vec<String>,
    format: Arc<dyn PipelineFormat>,
}

/// Ordered registry of pipeline formats.
pub struct FormatRegistry {
    registrations: Vec<Registration>,
}

/// Candidate workflow paths, tried in order.
const YAML_PATHS: &[&str] = &[
    ".crucible/workflow.yml",
    ".crucible/workflow.yaml",
    "crucible.yml",
    "crucible.yaml",
];

impl FormatRegistry {
    /// Registry with the built-in YAML workflow format. Hosts may register
    /// additional formats (an EDN converter, say) at higher priority.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            registrations: Vec::new(),
        };
        registry.register(
            PipelineSource::RepoYaml,
            YAML_PATHS.iter().map(|p| p.to_string()).collect(),
            Arc::new(YamlFormat),
        );
        registry
    }

    /// Register a format at the end of the priority order.
    pub fn register(
        &mut self,
        source: PipelineSource,
        paths: Vec<String>,
        format: Arc<dyn PipelineFormat>,
    ) {
        self.registrations.push(Registration {
            source,
            paths,
            format,
        });
    }

    /// Register a format ahead of everything already present.
    pub fn register_front(
        &mut self,
        source: PipelineSource,
        paths: Vec<String>,
        format: Arc<dyn PipelineFormat>,
    ) {
        self.registrations.insert(
            0,
            Registration {
                source,
                paths,
                format,
            },
        );
    }

    /// Find and parse the highest-priority pipeline file in the workspace.
    /// Returns None when no registered file exists.
    pub fn resolve(&self, workspace: &Path) -> Result<Option<ResolvedPipeline>> {
        for registration in &self.registrations {
            for candidate in &registration.paths {
                let path = workspace.join(candidate);
                if !path.is_file() {
                    continue;
                }
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| Error::PipelineInvalid(format!("read {candidate}: {e}")))?;
                let pipeline = registration.format.parse(&text)?;
                pipeline.validate()?;
                return Ok(Some(ResolvedPipeline {
                    source: registration.source,
                    pipeline,
                }));
            }
        }
        Ok(None)
    }
}

/// The built-in YAML workflow format.
pub struct YamlFormat;

impl PipelineFormat for YamlFormat {
    fn parse(&self, text: &str) -> Result<Pipeline> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| Error::PipelineInvalid(format!("yaml: {e}")))?;
        let mut json = yaml_to_json(value)?;
        stringify_matrix_scalars(&mut json);
        serde_json::from_value(json).map_err(|e| Error::PipelineInvalid(format!("workflow: {e}")))
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::PipelineInvalid(format!("yaml value: {e}")))
}

/// Matrix axis values are strings in the pipeline value, but YAML authors
/// write bare scalars (`jdk: [11, 17]`). Stringify scalars inside every
/// `matrix` mapping before deserializing.
fn stringify_matrix_scalars(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "matrix" {
                    if let serde_json::Value::Object(matrix) = child {
                        for (axis, axis_values) in matrix.iter_mut() {
                            if axis == "exclude" {
                                if let serde_json::Value::Array(items) = axis_values {
                                    for item in items {
                                        if let serde_json::Value::Object(combo) = item {
                                            for v in combo.values_mut() {
                                                stringify_scalar(v);
                                            }
                                        }
                                    }
                                }
                            } else if let serde_json::Value::Array(items) = axis_values {
                                for item in items {
                                    stringify_scalar(item);
                                }
                            }
                        }
                    }
                } else {
                    stringify_matrix_scalars(child);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                stringify_matrix_scalars(item);
            }
        }
        _ => {}
    }
}

fn stringify_scalar(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Number(n) => *value = serde_json::Value::String(n.to_string()),
        serde_json::Value::Bool(b) => *value = serde_json::Value::String(b.to_string()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::pipeline::StepType;

    const WORKFLOW: &str = r#"
name: ci
stages:
  - name: Build
    matrix:
      jdk: [11, 17]
      os: [linux]
    steps:
      - name: compile
        command: make build
  - name: Test
    depends_on: [Build]
    steps:
      - name: unit
        type: shell
        command: make test
        timeout_ms: 60000
"#;

    #[test]
    fn yaml_workflow_parses_with_numeric_matrix_axes() {
        let pipeline = YamlFormat.parse(WORKFLOW).unwrap();
        assert_eq!(pipeline.stages.len(), 2);
        let matrix = pipeline.stages[0].matrix.as_ref().unwrap();
        assert_eq!(matrix.axes["jdk"], vec!["11", "17"]);
        assert_eq!(pipeline.stages[1].steps[0].step_type, StepType::Shell);
        assert_eq!(pipeline.stages[1].steps[0].timeout_ms, Some(60000));
    }

    #[test]
    fn resolve_prefers_higher_priority_registration() {
        struct StubFormat;
        impl PipelineFormat for StubFormat {
            fn parse(&self, _text: &str) -> Result<Pipeline> {
                Ok(Pipeline {
                    stages: vec![crucible_core::pipeline::Stage::new(
                        "FromStub",
                        vec![crucible_core::pipeline::Step::shell("c", "echo ok")],
                    )],
                    ..Default::default()
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pipeline.edn"), "(stub)").unwrap();
        std::fs::write(dir.path().join("crucible.yml"), WORKFLOW).unwrap();

        let mut registry = FormatRegistry::with_defaults();
        registry.register_front(
            PipelineSource::RepoEdn,
            vec!["pipeline.edn".to_string()],
            Arc::new(StubFormat),
        );

        let resolved = registry.resolve(dir.path()).unwrap().unwrap();
        assert_eq!(resolved.source, PipelineSource::RepoEdn);
        assert_eq!(resolved.pipeline.stages[0].name, "FromStub");
    }

    #[test]
    fn resolve_returns_none_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FormatRegistry::with_defaults();
        assert!(registry.resolve(dir.path()).unwrap().is_none());
    }

    #[test]
    fn yaml_fallback_used_when_no_edn() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crucible.yml"), WORKFLOW).unwrap();
        let registry = FormatRegistry::with_defaults();
        let resolved = registry.resolve(dir.path()).unwrap().unwrap();
        assert_eq!(resolved.source, PipelineSource::RepoYaml);
    }
}
