//! Dependency ordering between target objects
//!
//! An object depends on another when one of its rules reads
//! `self.<Other>.<field>`. Building objects in topological order guarantees
//! the referenced record exists before anything reads from it.

use std::collections::{BTreeMap, BTreeSet};

use super::ObjectConfig;

/// Dependency graph over the configured target objects
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Adjacency list: object -> objects it reads from
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Reverse adjacency: object -> objects that read from it
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Tie-break for objects that become ready at the same time
    priorities: BTreeMap<String, u32>,
}

impl DependencyGraph {
    /// Build the graph from object configs keyed by name
    pub fn build(objects: &BTreeMap<String, ObjectConfig>) -> Self {
        let mut graph = DependencyGraph::default();

        for (name, object) in objects {
            graph.priorities.insert(name.clone(), object.priority);
            graph.dependents.entry(name.clone()).or_default();

            let deps: BTreeSet<String> = object
                .self_paths()
                .filter(|p| p.segments().len() > 1)
                .map(|p| p.head().to_string())
                .filter(|target| target != name && objects.contains_key(target))
                .collect();

            for dep in &deps {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(name.clone());
            }
            graph.dependencies.insert(name.clone(), deps);
        }

        graph
    }

    /// Objects the given object reads from
    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(name)
    }

    /// Kahn's algorithm; dependencies first, ties broken by (priority, name)
    pub fn topological_sort(&self) -> Result<Vec<String>, CycleError> {
        let mut remaining: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<(u32, &str)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| (self.priority(name), *name))
            .collect();

        let mut order = Vec::with_capacity(remaining.len());

        while let Some(next) = ready.pop_first() {
            let (_, name) = next;
            order.push(name.to_string());
            remaining.remove(name);

            if let Some(dependents) = self.dependents.get(name) {
                for dependent in dependents {
                    if let Some(count) = remaining.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert((self.priority(dependent), dependent.as_str()));
                        }
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(CycleError {
                objects: remaining.keys().map(|s| s.to_string()).collect(),
            });
        }

        Ok(order)
    }

    fn priority(&self, name: &str) -> u32 {
        self.priorities.get(name).copied().unwrap_or_default()
    }
}

/// Error when `self` references form a cycle
#[derive(Debug, Clone)]
pub struct CycleError {
    pub objects: Vec<String>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circular self reference between objects: {}",
            self.objects.join(", ")
        )
    }
}

impl std::error::Error for CycleError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldPath, FieldRule};

    fn object(name: &str, priority: u32, refs: &[&str]) -> (String, ObjectConfig) {
        let mut config = ObjectConfig::flat(name, "personId", "HR_Id");
        config.priority = priority;
        for (i, target) in refs.iter().enumerate() {
            config.fields.insert(
                format!("Ref{}", i),
                FieldRule::Direct(FieldPath::parse(&format!("self.{}.Id", target)).unwrap()),
            );
        }
        (name.to_string(), config)
    }

    #[test]
    fn test_dependencies_come_first() {
        let objects: BTreeMap<_, _> = [
            object("Names", 0, &["Contact"]),
            object("Contact", 5, &[]),
            object("Assignment", 0, &["Contact", "Names"]),
        ]
        .into_iter()
        .collect();

        let graph = DependencyGraph::build(&objects);
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["Contact", "Names", "Assignment"]);
        assert_eq!(graph.dependencies_of("Assignment").unwrap().len(), 2);
    }

    #[test]
    fn test_priority_breaks_ties() {
        let objects: BTreeMap<_, _> = [
            object("Alpha", 2, &[]),
            object("Beta", 1, &[]),
            object("Gamma", 1, &[]),
        ]
        .into_iter()
        .collect();

        let order = DependencyGraph::build(&objects).topological_sort().unwrap();
        assert_eq!(order, vec!["Beta", "Gamma", "Alpha"]);
    }

    #[test]
    fn test_cycle_detected() {
        let objects: BTreeMap<_, _> = [
            object("A", 0, &["B"]),
            object("B", 0, &["A"]),
            object("C", 0, &[]),
        ]
        .into_iter()
        .collect();

        let err = DependencyGraph::build(&objects).topological_sort().unwrap_err();
        assert_eq!(err.objects, vec!["A", "B"]);
        assert!(err.to_string().contains("A, B"));
    }

    #[test]
    fn test_own_field_references_are_not_edges() {
        let (name, mut config) = object("Contact", 0, &[]);
        config.fields.insert(
            "Alias".to_string(),
            FieldRule::Direct(FieldPath::parse("self.Email").unwrap()),
        );
        let objects: BTreeMap<_, _> = [(name, config)].into_iter().collect();

        let graph = DependencyGraph::build(&objects);
        assert!(graph.dependencies_of("Contact").unwrap().is_empty());
    }
}
