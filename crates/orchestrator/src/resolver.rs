//! Dependency resolution

use crate::config::PipelineConfig;
use race_vision_common::{ProcessingError, Result, Task};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Expand requested task codes into the ordered set of tasks that must run.
///
/// Every code is validated before anything else happens. The result holds each task
/// once, every prerequisite ahead of the tasks that consume it, and ties broken by
/// task code so the order is deterministic.
///
/// # Errors
///
/// Returns `InvalidTask` for an unknown code and `Config` if the configured graph
/// is incomplete or cyclic.
pub fn resolve_tasks(config: &PipelineConfig, requested: &[i32]) -> Result<Vec<Task>> {
    let requested = requested
        .iter()
        .map(|&code| Task::from_code(code))
        .collect::<Result<Vec<_>>>()?;

    // Close over prerequisites so partial dependency lists still pull in everything
    let mut closure = BTreeSet::new();
    let mut queue = requested.clone();
    while let Some(task) = queue.pop() {
        if closure.insert(task) {
            queue.extend(config.task(task)?.dependencies.iter().copied());
        }
    }

    let order = topological_order(config, &closure)?;
    info!(
        "Resolved tasks {:?} -> {:?}",
        requested.iter().map(|t| t.code()).collect::<Vec<_>>(),
        order.iter().map(|t| t.code()).collect::<Vec<_>>()
    );
    Ok(order)
}

/// Kahn's algorithm over the prerequisite edges inside `tasks`
fn topological_order(config: &PipelineConfig, tasks: &BTreeSet<Task>) -> Result<Vec<Task>> {
    let mut blocking: BTreeMap<Task, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<Task, Vec<Task>> = BTreeMap::new();
    for &task in tasks {
        let prerequisites: BTreeSet<Task> = config
            .task(task)?
            .dependencies
            .iter()
            .copied()
            .filter(|&dep| dep != task && tasks.contains(&dep))
            .collect();
        blocking.insert(task, prerequisites.len());
        for dep in prerequisites {
            dependents.entry(dep).or_default().push(task);
        }
    }

    let mut ready: BTreeSet<Task> = blocking
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&task, _)| task)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(task) = ready.pop_first() {
        order.push(task);
        for &next in dependents.get(&task).into_iter().flatten() {
            if let Some(count) = blocking.get_mut(&next) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() != tasks.len() {
        return Err(ProcessingError::Config(
            "task graph contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(codes: &[i32]) -> Vec<Task> {
        resolve_tasks(&PipelineConfig::default(), codes).unwrap()
    }

    fn position(order: &[Task], task: Task) -> usize {
        order.iter().position(|&t| t == task).unwrap()
    }

    #[test]
    fn test_base_task_alone() {
        assert_eq!(resolve(&[0]), vec![Task::SceneClassify]);
    }

    #[test]
    fn test_frame_extractor_runs_after_classification() {
        // FrameExtractor has the lowest code but depends on SceneClassify
        assert_eq!(
            resolve(&[-1]),
            vec![Task::SceneClassify, Task::FrameExtractor]
        );
    }

    #[test]
    fn test_union_is_deduplicated_and_ordered() {
        let order = resolve(&[2, 6]);
        assert_eq!(
            order,
            vec![
                Task::SceneClassify,
                Task::RailPoleMask,
                Task::Detection,
                Task::Tracking
            ]
        );

        let order = resolve(&[4, 4, 1, 0]);
        assert_eq!(order.len(), 5);
        assert!(position(&order, Task::RailMask) < position(&order, Task::OpticalFlow));
        assert!(position(&order, Task::SemanticMask) < position(&order, Task::OpticalFlow));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let once = resolve(&[6, 4, -1]);
        let codes: Vec<i32> = once.iter().map(|t| t.code()).collect();
        assert_eq!(resolve(&codes), once);
    }

    #[test]
    fn test_invalid_code_rejected() {
        let err = resolve_tasks(&PipelineConfig::default(), &[1, 9]).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidTask(9)));
    }

    #[test]
    fn test_partial_dependency_lists_are_closed() {
        let mut config = PipelineConfig::default();
        // Tracking lists only Detection, which itself requires SceneClassify
        config
            .tasks
            .get_mut(&Task::Tracking)
            .unwrap()
            .dependencies = vec![Task::Detection, Task::Tracking];
        let order = resolve_tasks(&config, &[6]).unwrap();
        assert_eq!(
            order,
            vec![Task::SceneClassify, Task::Detection, Task::Tracking]
        );
    }
}
