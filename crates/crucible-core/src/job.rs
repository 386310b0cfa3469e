//! Job templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::build::TriggerType;
use crate::pipeline::{ParamDef, Pipeline};

/// Source checkout configuration for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

/// Trigger configuration for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub allowed: Vec<TriggerType>,
    /// Coalesce builds for the same commit inside this window (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_window_ms: Option<u64>,
}

/// A named pipeline template. Immutable once referenced by a running build;
/// edits create a new logical version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub org_id: ResourceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server-side pipeline definition, lowest-priority resolution source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_value: Option<Pipeline>,
    #[serde(default)]
    pub parameter_defs: Vec<ParamDef>,
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_config: Option<SourceConfig>,
    /// Labels a dispatched agent must carry.
    #[serde(default)]
    pub agent_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<crate::queue::Priority>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(org_id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            org_id,
            name: name.into(),
            description: None,
            pipeline_value: None,
            parameter_defs: Vec::new(),
            trigger_config: TriggerConfig::default(),
            source_config: None,
            agent_labels: Vec::new(),
            priority: None,
            created_at: Utc::now(),
        }
    }

    /// Validate trigger parameters against the declared defs and fill in
    /// defaults. Unknown parameters are rejected.
    pub fn resolve_parameters(
        &self,
        supplied: &std::collections::HashMap<String, String>,
    ) -> crate::Result<std::collections::HashMap<String, String>> {
        for key in supplied.keys() {
            if !self.parameter_defs.iter().any(|def| &def.name == key) {
                return Err(crate::Error::InvalidInput(format!("unknown parameter: {key}")));
            }
        }
        let mut resolved = std::collections::HashMap::new();
        for def in &self.parameter_defs {
            let value = supplied.get(&def.name).cloned().or_else(|| def.default.clone());
            match value {
                Some(value) => {
                    if !def.choices.is_empty() && !def.choices.contains(&value) {
                        return Err(crate::Error::InvalidInput(format!(
                            "parameter {} value {value} not in choices",
                            def.name
                        )));
                    }
                    resolved.insert(def.name.clone(), value);
                }
                None => {
                    return Err(crate::Error::InvalidInput(format!(
                        "missing required parameter: {}",
                        def.name
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parameters_fill_defaults_and_enforce_choices() {
        let mut job = Job::new(ResourceId::new(), "build");
        job.parameter_defs = vec![
            ParamDef {
                name: "target".into(),
                default: Some("debug".into()),
                choices: vec!["debug".into(), "release".into()],
                description: None,
            },
        ];

        let resolved = job.resolve_parameters(&HashMap::new()).unwrap();
        assert_eq!(resolved["target"], "debug");

        let supplied = HashMap::from([("target".to_string(), "release".to_string())]);
        let resolved = job.resolve_parameters(&supplied).unwrap();
        assert_eq!(resolved["target"], "release");

        let bad = HashMap::from([("target".to_string(), "profile".to_string())]);
        assert!(job.resolve_parameters(&bad).is_err());

        let unknown = HashMap::from([("other".to_string(), "x".to_string())]);
        assert!(job.resolve_parameters(&unknown).is_err());
    }
}
