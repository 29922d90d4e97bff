//! Dependency resolution: orders a dependency graph into parallel batches.

use larkbot_core::error::{LarkBotError, Result};
use std::collections::{HashMap, HashSet};

/// Topological batching over named nodes.
///
/// Each batch holds nodes whose dependencies are all in earlier batches, so
/// the nodes of one batch may run concurrently. Batch members keep the
/// order in which nodes were added.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    nodes: Vec<(String, Vec<String>)>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, depends_on)` pairs.
    pub fn from_edges<I, N, D>(edges: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut resolver = Self::new();
        for (name, deps) in edges {
            resolver.add(name, deps);
        }
        resolver
    }

    pub fn add<D>(&mut self, name: impl Into<String>, depends_on: D)
    where
        D: IntoIterator,
        D::Item: Into<String>,
    {
        self.nodes
            .push((name.into(), depends_on.into_iter().map(Into::into).collect()));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, _) in &self.nodes {
            if !seen.insert(name.as_str()) {
                return Err(LarkBotError::Validation(format!("Duplicate name '{name}'")));
            }
        }
        for (name, deps) in &self.nodes {
            if let Some(missing) = deps.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(LarkBotError::Validation(format!(
                    "'{name}' depends on unknown '{missing}'"
                )));
            }
        }
        Ok(())
    }

    /// Parallel-safe batches in execution order.
    ///
    /// Fails with [`LarkBotError::CircularDependency`] when some nodes can
    /// never become ready, and with [`LarkBotError::Validation`] on unknown
    /// or duplicate names.
    pub fn get_execution_order(&self) -> Result<Vec<Vec<String>>> {
        self.validate()?;

        let mut resolved: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&(String, Vec<String>)> = self.nodes.iter().collect();
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|(_, deps)| deps.iter().all(|d| resolved.contains(d.as_str())));

            if ready.is_empty() {
                let cycle = self
                    .find_cycle()
                    .unwrap_or_else(|| blocked.iter().map(|(n, _)| n.clone()).collect());
                return Err(LarkBotError::CircularDependency(cycle.join(" -> ")));
            }

            resolved.extend(ready.iter().copied().map(|(n, _)| n.as_str()));
            batches.push(ready.into_iter().map(|(n, _)| n.clone()).collect());
            remaining = blocked;
        }
        Ok(batches)
    }

    /// One dependency cycle, first node repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let graph: HashMap<&str, &Vec<String>> =
            self.nodes.iter().map(|(n, d)| (n.as_str(), d)).collect();
        let mut done: HashSet<&str> = HashSet::new();

        for (start, _) in &self.nodes {
            let mut path: Vec<&str> = Vec::new();
            if let Some(cycle) = Self::visit(start, &graph, &mut path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, &'a Vec<String>>,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        path.push(node);
        for dep in graph.get(node).copied().into_iter().flatten() {
            if let Some(cycle) = Self::visit(dep, graph, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_sets(batches: Vec<Vec<String>>) -> Vec<HashSet<String>> {
        batches.into_iter().map(|b| b.into_iter().collect()).collect()
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parallel_batches() {
        let resolver = DependencyResolver::from_edges([
            ("C", vec!["A", "B"]),
            ("A", vec![]),
            ("B", vec![]),
        ]);
        let order = resolver.get_execution_order().unwrap();
        assert_eq!(as_sets(order), vec![set(&["A", "B"]), set(&["C"])]);
    }

    #[test]
    fn test_chain_and_diamond() {
        let resolver = DependencyResolver::from_edges([
            ("fetch", vec![]),
            ("parse", vec!["fetch"]),
            ("stats", vec!["parse"]),
            ("index", vec!["parse"]),
            ("report", vec!["stats", "index"]),
        ]);
        let order = resolver.get_execution_order().unwrap();
        assert_eq!(
            order,
            vec![
                vec!["fetch".to_string()],
                vec!["parse".to_string()],
                vec!["stats".to_string(), "index".to_string()],
                vec!["report".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_is_detected() {
        let resolver = DependencyResolver::from_edges([("A", vec!["B"]), ("B", vec!["A"])]);
        let err = resolver.get_execution_order().unwrap_err();
        assert!(matches!(err, LarkBotError::CircularDependency(_)));
        assert!(err.is_structural());
        let cycle = resolver.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let resolver = DependencyResolver::from_edges([
            ("root", vec![]),
            ("x", vec!["root", "z"]),
            ("y", vec!["x"]),
            ("z", vec!["y"]),
        ]);
        match resolver.get_execution_order() {
            Err(LarkBotError::CircularDependency(msg)) => {
                assert!(msg.contains('x') && msg.contains('y') && msg.contains('z'));
                assert!(!msg.contains("root"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let resolver = DependencyResolver::from_edges([("A", vec!["A"])]);
        assert!(matches!(
            resolver.get_execution_order(),
            Err(LarkBotError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let resolver = DependencyResolver::from_edges([("A", vec!["ghost"])]);
        assert!(matches!(
            resolver.get_execution_order(),
            Err(LarkBotError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_graph() {
        assert!(DependencyResolver::new().get_execution_order().unwrap().is_empty());
    }
}
