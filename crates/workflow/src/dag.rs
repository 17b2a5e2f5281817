//! 工作流依赖图校验
//!
//! 依赖图以 `步骤 ID → 依赖的步骤 ID 列表` 表示。

use std::collections::{HashMap, VecDeque};

use orchestrator_errors::{OrchestratorError, OrchestratorResult};

/// 按 Kahn 算法计算执行顺序
///
/// `order` 为步骤的声明顺序，同一层中入度为 0 的步骤按声明顺序输出。
/// 引用了不存在的步骤时返回 `StepNotFound`，存在环时返回 `CircularDependency`。
pub fn topological_order(
    workflow_id: &str,
    order: &[String],
    graph: &HashMap<String, Vec<String>>,
) -> OrchestratorResult<Vec<String>> {
    for step_id in order {
        let Some(dependencies) = graph.get(step_id) else {
            continue;
        };
        if let Some(unknown) = dependencies.iter().find(|dep| !graph.contains_key(*dep)) {
            return Err(OrchestratorError::step_not_found(workflow_id, unknown));
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step_id in order {
        let dependencies = graph.get(step_id).map(Vec::as_slice).unwrap_or_default();
        in_degree.insert(step_id.as_str(), dependencies.len());
        for dep in dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = order
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut sorted = Vec::with_capacity(order.len());
    while let Some(node) = queue.pop_front() {
        sorted.push(node.to_string());

        if let Some(children) = dependents.get(node) {
            for &child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
    }

    if sorted.len() < order.len() {
        let remaining: Vec<&String> = order.iter().filter(|id| !sorted.contains(*id)).collect();
        return Err(OrchestratorError::CircularDependency(format!(
            "工作流 {workflow_id} 中的步骤 {remaining:?}"
        )));
    }
    Ok(sorted)
}

pub fn validate_graph(
    workflow_id: &str,
    order: &[String],
    graph: &HashMap<String, Vec<String>>,
) -> OrchestratorResult<()> {
    topological_order(workflow_id, order, graph).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> (Vec<String>, HashMap<String, Vec<String>>) {
        let order = edges.iter().map(|(id, _)| id.to_string()).collect();
        let graph = edges
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect();
        (order, graph)
    }

    #[test]
    fn test_order_respects_dependencies() {
        let (order, g) = graph(&[("c", &["a", "b"]), ("b", &["a"]), ("a", &[])]);
        assert_eq!(topological_order("wf", &order, &g).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_independent_steps_keep_declared_order() {
        let (order, g) = graph(&[("x", &[]), ("y", &[]), ("z", &["y"])]);
        assert_eq!(topological_order("wf", &order, &g).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let (order, g) = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let err = validate_graph("wf", &order, &g).unwrap_err();
        match err {
            OrchestratorError::CircularDependency(message) => {
                assert!(message.contains("\"a\""));
                assert!(!message.contains("\"d\""));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let (order, g) = graph(&[("a", &["a"])]);
        assert!(matches!(
            validate_graph("wf", &order, &g),
            Err(OrchestratorError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let (order, g) = graph(&[("a", &["ghost"])]);
        match validate_graph("wf", &order, &g).unwrap_err() {
            OrchestratorError::StepNotFound {
                workflow_id,
                step_id,
            } => {
                assert_eq!(workflow_id, "wf");
                assert_eq!(step_id, "ghost");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
