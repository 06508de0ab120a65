//! Job dependency graph and topological ordering.
//!
//! An edge `A → B` means "B needs A": A must reach a terminal outcome
//! before B may start. The graph is validated structurally (duplicate
//! names, unknown dependencies, cycles) before anything executes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bootgate_core::{GateError, JobSpec, Result};

/// Validated directed acyclic graph over [`JobSpec`]s.
#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: BTreeMap<String, JobSpec>,
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<String, BTreeSet<String>>,
    /// Declaration order, used to keep ordering deterministic.
    declared: Vec<String>,
}

impl JobGraph {
    /// Build and validate the graph.
    pub fn new(specs: Vec<JobSpec>) -> Result<Self> {
        let mut jobs = BTreeMap::new();
        let mut declared = Vec::with_capacity(specs.len());
        for spec in specs {
            if jobs.contains_key(&spec.name) {
                return Err(GateError::DuplicateJob(spec.name));
            }
            declared.push(spec.name.clone());
            jobs.insert(spec.name.clone(), spec);
        }

        let mut downstream: BTreeMap<String, BTreeSet<String>> =
            jobs.keys().map(|name| (name.clone(), BTreeSet::new())).collect();
        for spec in jobs.values() {
            for dependency in &spec.needs {
                match downstream.get_mut(dependency) {
                    Some(dependents) => {
                        dependents.insert(spec.name.clone());
                    }
                    None => {
                        return Err(GateError::UnknownDependency {
                            job: spec.name.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
        }

        let graph = Self {
            jobs,
            downstream,
            declared,
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(GateError::CyclicDependency { jobs: cycle });
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.get(name)
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &JobSpec> {
        self.declared.iter().filter_map(|name| self.jobs.get(name))
    }

    /// Direct dependencies of `name`.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.jobs
            .get(name)
            .map(|job| job.needs.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.downstream
            .get(name)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All transitive dependents of `name` (BFS over downstream edges).
    pub fn transitive_dependents_of(&self, name: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.downstream.get(&current) {
                for dependent in dependents {
                    if visited.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        visited
    }

    /// Job names with dependencies before dependents (Kahn's algorithm).
    /// Ready jobs are taken in declaration order.
    pub fn topological_order(&self) -> Vec<String> {
        let position: BTreeMap<&str, usize> = self
            .declared
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut in_degree: BTreeMap<&str, usize> = self
            .jobs
            .values()
            .map(|job| (job.name.as_str(), job.needs.len()))
            .collect();

        let mut ready: Vec<&str> = self
            .declared
            .iter()
            .map(String::as_str)
            .filter(|name| in_degree.get(name) == Some(&0))
            .collect();
        let mut sorted = Vec::with_capacity(self.jobs.len());

        while !ready.is_empty() {
            let name = ready.remove(0);
            sorted.push(name.to_string());
            let mut next = Vec::new();
            for dependent in self.dependents_of(name) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
            ready.extend(next);
            ready.sort_by_key(|n| position.get(n).copied().unwrap_or(usize::MAX));
        }
        sorted
    }

    /// DFS for a back edge; returns the jobs on the cycle.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a JobGraph,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                    return Some(stack[start..].iter().map(|s| s.to_string()).collect());
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            stack.push(node);
            if let Some(dependents) = graph.downstream.get(node) {
                for dependent in dependents {
                    if let Some(cycle) = visit(graph, dependent, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for name in &self.declared {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(self, name, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topological_order_respects_needs() {
        let graph = JobGraph::new(vec![
            JobSpec::new("integration").needs("build"),
            JobSpec::new("docs"),
            JobSpec::new("build"),
        ])
        .unwrap();
        assert_eq!(graph.topological_order(), vec!["docs", "build", "integration"]);
    }

    #[test]
    fn test_cycle_detection() {
        let err = JobGraph::new(vec![
            JobSpec::new("a").needs("c"),
            JobSpec::new("b").needs("a"),
            JobSpec::new("c").needs("b"),
            JobSpec::new("d"),
        ])
        .unwrap_err();
        match err {
            GateError::CyclicDependency { jobs } => {
                assert_eq!(jobs.len(), 3);
                assert!(!jobs.contains(&"d".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = JobGraph::new(vec![JobSpec::new("a").needs("a")]).unwrap_err();
        assert!(matches!(err, GateError::CyclicDependency { .. }));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = JobGraph::new(vec![JobSpec::new("a").needs("ghost")]).unwrap_err();
        assert!(matches!(err, GateError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
    }

    #[test]
    fn test_duplicate_job() {
        let err = JobGraph::new(vec![JobSpec::new("a"), JobSpec::new("a")]).unwrap_err();
        assert!(matches!(err, GateError::DuplicateJob(ref name) if name == "a"));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = JobGraph::new(vec![
            JobSpec::new("build"),
            JobSpec::new("test").needs("build"),
            JobSpec::new("deploy").needs("test"),
            JobSpec::new("lint"),
        ])
        .unwrap();
        let dependents = graph.transitive_dependents_of("build");
        assert_eq!(
            dependents.into_iter().collect::<Vec<_>>(),
            vec!["deploy".to_string(), "test".to_string()]
        );
    }
}
