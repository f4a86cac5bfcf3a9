use std::collections::HashSet;

/// Reports whether registering `task` with the given `upstream` ids would
/// close a cycle. `upstreams_of` returns the upstream ids of a task that is
/// already registered; ids it does not know are treated as leaves.
pub fn creates_cycle<'g, F>(task: &str, upstream: &[String], upstreams_of: F) -> bool
where
    F: Fn(&str) -> Option<&'g [String]>,
{
    let mut visited = HashSet::new();

    fn dfs<'g, F>(node: &str, target: &str, upstreams_of: &F, visited: &mut HashSet<String>) -> bool
    where
        F: Fn(&str) -> Option<&'g [String]>,
    {
        if node == target {
            return true;
        }
        if !visited.insert(node.to_string()) {
            return false;
        }

        if let Some(deps) = upstreams_of(node) {
            for dep in deps {
                if dfs(dep, target, upstreams_of, visited) {
                    return true;
                }
            }
        }

        false
    }

    upstream
        .iter()
        .any(|dep| dfs(dep, task, &upstreams_of, &mut visited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn edges(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(task, deps)| {
                (
                    task.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    fn check(graph: &HashMap<String, Vec<String>>, task: &str, upstream: &[&str]) -> bool {
        let upstream: Vec<String> = upstream.iter().map(|d| d.to_string()).collect();
        creates_cycle(task, &upstream, |id| graph.get(id).map(Vec::as_slice))
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        assert!(check(&HashMap::new(), "a", &["a"]));
    }

    #[test]
    fn closing_edge_through_forward_reference() {
        // a was registered waiting on c, which does not exist yet
        let graph = edges(&[("a", &["c"]), ("b", &["a"])]);
        assert!(check(&graph, "c", &["b"]));
        assert!(!check(&graph, "d", &["b"]));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let graph = edges(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        assert!(!check(&graph, "d", &["b", "c"]));
    }
}
