//! Stage dependency graph.
//!
//! Kahn's algorithm for validation and topological order, plus the ready-set
//! computation the scheduler loops on. Execution itself lives in the
//! executor; this module is pure structure.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crucible_core::pipeline::Stage;
use crucible_core::{Error, Result};

/// Validated dependency graph over stage names.
#[derive(Debug, Clone)]
pub struct Dag {
    /// Topological order (Kahn).
    pub order: Vec<String>,
    deps: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

/// DAG mode applies when any stage declares a dependency.
pub fn is_dag_mode(stages: &[Stage]) -> bool {
    stages.iter().any(|s| !s.depends_on.is_empty())
}

impl Dag {
    /// Build and validate the graph. Unknown dependency names fail with
    /// `dag-unresolved`; cycles fail with `dag-cycle` naming the cycle
    /// members.
    pub fn build(stages: &[Stage]) -> Result<Self> {
        let names: HashSet<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for stage in stages {
            deps.entry(stage.name.clone()).or_default();
            dependents.entry(stage.name.clone()).or_default();
            for dep in &stage.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(Error::DagUnresolved(format!(
                        "stage {} depends on unknown stage {dep}",
                        stage.name
                    )));
                }
                deps.get_mut(&stage.name).unwrap().insert(dep.clone());
                dependents.entry(dep.clone()).or_default().insert(stage.name.clone());
            }
        }

        // Kahn's algorithm.
        let mut in_degree: HashMap<&str, usize> = deps
            .iter()
            .map(|(name, dependencies)| (name.as_str(), dependencies.len()))
            .collect();
        let mut queue: VecDeque<&str> = stages
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| in_degree[name] == 0)
            .collect();
        let mut order = Vec::with_capacity(stages.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            if let Some(children) = dependents.get(name) {
                for child in children {
                    let degree = in_degree.get_mut(child.as_str()).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        if order.len() != stages.len() {
            let mut cycle: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            cycle.sort();
            return Err(Error::DagCycle(cycle.join(" -> ")));
        }

        Ok(Self {
            order,
            deps,
            dependents,
        })
    }

    /// Stages whose dependencies are all in `completed` and which are not
    /// themselves settled or running.
    pub fn ready(
        &self,
        completed: &HashSet<String>,
        settled: &HashSet<String>,
        running: &HashSet<String>,
    ) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                !settled.contains(*name)
                    && !running.contains(*name)
                    && self.deps[*name].iter().all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &String> {
        self.deps.get(name).into_iter().flatten()
    }

    /// Every transitive dependent of `name`.
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<&String> = self.dependents.get(name).into_iter().flatten().collect();
        while let Some(current) = stack.pop() {
            if out.insert(current.clone()) {
                stack.extend(self.dependents.get(current).into_iter().flatten());
            }
        }
        out
    }
}
