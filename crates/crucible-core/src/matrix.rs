//! Matrix expansion.
//!
//! A stage with a matrix becomes one stage per cartesian combination of its
//! axes, minus exclusions. Expansion happens before DAG resolution so that a
//! `depends_on` naming a matrix base fans in to every expansion.

use std::collections::BTreeMap;

use crate::pipeline::{Matrix, Stage};
use crate::{Error, Result};

/// Hard ceiling on combinations per stage.
pub const MAX_COMBINATIONS: usize = 25;

/// Expand every matrix stage in `stages`. Returns the flattened stage list
/// plus a map from base name to expanded names (for dependency fan-in).
pub fn expand_stages(stages: Vec<Stage>) -> Result<(Vec<Stage>, BTreeMap<String, Vec<String>>)> {
    let mut expanded = Vec::new();
    let mut fan_in: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for stage in stages {
        match stage.matrix.clone() {
            Some(matrix) if !matrix.axes.is_empty() => {
                let variants = expand_stage(&stage, &matrix)?;
                fan_in.insert(
                    stage.name.clone(),
                    variants.iter().map(|s| s.name.clone()).collect(),
                );
                expanded.extend(variants);
            }
            _ => {
                fan_in.insert(stage.name.clone(), vec![stage.name.clone()]);
                expanded.push(stage);
            }
        }
    }

    // Rewrite depends_on through the fan-in map.
    for stage in &mut expanded {
        let deps = std::mem::take(&mut stage.depends_on);
        for dep in deps {
            match fan_in.get(&dep) {
                Some(names) => stage.depends_on.extend(names.iter().cloned()),
                None => stage.depends_on.push(dep),
            }
        }
    }

    Ok((expanded, fan_in))
}

fn expand_stage(stage: &Stage, matrix: &Matrix) -> Result<Vec<Stage>> {
    let combos = combinations(matrix)?;
    let mut variants = Vec::with_capacity(combos.len());
    for combo in combos {
        let mut variant = stage.clone();
        variant.matrix = None;
        variant.name = format!("{} [{}]", stage.name, render_combo(&combo));
        for step in &mut variant.steps {
            for (axis, value) in &combo {
                step.env
                    .insert(format!("MATRIX_{}", axis.to_uppercase()), value.clone());
            }
        }
        variants.push(variant);
    }
    Ok(variants)
}

/// Cartesian product of the axes with exclusions applied, in ascending
/// lexical axis order.
fn combinations(matrix: &Matrix) -> Result<Vec<BTreeMap<String, String>>> {
    let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for (axis, values) in &matrix.axes {
        if values.is_empty() {
            return Err(Error::PipelineInvalid(format!("matrix axis {axis} has no values")));
        }
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(axis.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
        if combos.len() > MAX_COMBINATIONS {
            return Err(Error::MatrixExplosion(format!(
                "{} combinations exceed the limit of {MAX_COMBINATIONS}",
                combos.len()
            )));
        }
    }
    combos.retain(|combo| !is_excluded(combo, &matrix.exclude));
    Ok(combos)
}

fn is_excluded(combo: &BTreeMap<String, String>, exclusions: &[BTreeMap<String, String>]) -> bool {
    exclusions.iter().any(|excl| {
        !excl.is_empty() && excl.iter().all(|(axis, value)| combo.get(axis) == Some(value))
    })
}

fn render_combo(combo: &BTreeMap<String, String>) -> String {
    combo
        .iter()
        .map(|(axis, value)| format!("{axis}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Step;

    fn matrix_stage(axes: &[(&str, &[&str])], exclude: Vec<BTreeMap<String, String>>) -> Stage {
        let mut stage = Stage::new("Build", vec![Step::shell("c", "echo ok")]);
        stage.matrix = Some(Matrix {
            axes: axes
                .iter()
                .map(|(axis, values)| {
                    (axis.to_string(), values.iter().map(|v| v.to_string()).collect())
                })
                .collect(),
            exclude,
        });
        stage
    }

    #[test]
    fn expands_cartesian_product_with_exclusion() {
        let exclude = vec![BTreeMap::from([
            ("os".to_string(), "macos".to_string()),
            ("jdk".to_string(), "11".to_string()),
        ])];
        let stage = matrix_stage(&[("os", &["linux", "macos"]), ("jdk", &["11", "17"])], exclude);
        let (stages, _) = expand_stages(vec![stage]).unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Build [jdk=11, os=linux]",
                "Build [jdk=17, os=linux]",
                "Build [jdk=17, os=macos]",
            ]
        );
    }

    #[test]
    fn injects_axis_env() {
        let stage = matrix_stage(&[("os", &["linux"])], vec![]);
        let (stages, _) = expand_stages(vec![stage]).unwrap();
        assert_eq!(stages[0].steps[0].env["MATRIX_OS"], "linux");
    }

    #[test]
    fn twenty_five_combinations_pass_twenty_six_reject() {
        let ok = matrix_stage(&[("a", &["1", "2", "3", "4", "5"]), ("b", &["1", "2", "3", "4", "5"])], vec![]);
        assert!(expand_stages(vec![ok]).is_ok());

        let over = matrix_stage(
            &[("a", &["1", "2", "3", "4", "5"]), ("b", &["1", "2", "3", "4", "5"]), ("c", &["1", "2"])],
            vec![],
        );
        let err = expand_stages(vec![over]).unwrap_err();
        assert_eq!(err.kind(), "matrix-explosion");
    }

    #[test]
    fn depends_on_base_name_fans_in() {
        let build = matrix_stage(&[("os", &["linux", "macos"])], vec![]);
        let mut publish = Stage::new("Publish", vec![Step::shell("p", "echo publish")]);
        publish.depends_on = vec!["Build".to_string()];

        let (stages, _) = expand_stages(vec![build, publish]).unwrap();
        let publish = stages.iter().find(|s| s.name == "Publish").unwrap();
        assert_eq!(
            publish.depends_on,
            vec!["Build [os=linux]".to_string(), "Build [os=macos]".to_string()]
        );
    }

    #[test]
    fn non_matrix_stages_pass_through() {
        let stage = Stage::new("Test", vec![Step::shell("t", "make test")]);
        let (stages, _) = expand_stages(vec![stage]).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name, "Test");
    }
}
