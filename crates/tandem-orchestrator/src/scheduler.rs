// Orchestrator Task Scheduler
// DAG validation, runnable selection and failure propagation

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::OrchestratorError;
use crate::types::{Task, TaskState};

// ============================================================================
// Task Scheduler
// ============================================================================

/// DAG-based task scheduler for orchestration. Ties between runnable tasks are
/// always broken by insertion order in the plan.
pub struct TaskScheduler;

impl TaskScheduler {
    fn completed_ids(tasks: &[Task]) -> HashSet<&str> {
        tasks
            .iter()
            .filter(|t| t.state == TaskState::Done)
            .map(|t| t.id.as_str())
            .collect()
    }

    fn is_ready(task: &Task, completed: &HashSet<&str>) -> bool {
        matches!(task.state, TaskState::Pending | TaskState::Runnable)
            && task
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
    }

    /// First task (in plan order) whose dependencies are all Done and that is
    /// not already running
    pub fn get_next_runnable(tasks: &[Task]) -> Option<&Task> {
        let completed = Self::completed_ids(tasks);
        tasks.iter().find(|task| Self::is_ready(task, &completed))
    }

    /// Get all runnable tasks, in plan order
    pub fn get_all_runnable(tasks: &[Task]) -> Vec<&Task> {
        let completed = Self::completed_ids(tasks);
        tasks
            .iter()
            .filter(|task| Self::is_ready(task, &completed))
            .collect()
    }

    /// Promote Pending tasks whose dependencies are all Done to Runnable.
    /// Returns the promoted ids.
    pub fn refresh_runnable(tasks: &mut [Task]) -> Vec<String> {
        let completed: HashSet<String> = Self::completed_ids(tasks)
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut promoted = Vec::new();
        for task in tasks.iter_mut() {
            if task.state == TaskState::Pending
                && task.dependencies.iter().all(|dep| completed.contains(dep))
            {
                task.state = TaskState::Runnable;
                promoted.push(task.id.clone());
            }
        }
        promoted
    }

    /// Check if all tasks are completed
    pub fn all_completed(tasks: &[Task]) -> bool {
        tasks.iter().all(|t| t.state == TaskState::Done)
    }

    /// Check if any task has failed
    pub fn any_failed(tasks: &[Task]) -> bool {
        tasks.iter().any(|t| t.state == TaskState::Failed)
    }

    /// No task can make further progress: everything is Done, Failed or Blocked
    pub fn is_settled(tasks: &[Task]) -> bool {
        tasks.iter().all(|t| {
            matches!(
                t.state,
                TaskState::Done | TaskState::Failed | TaskState::Blocked
            )
        })
    }

    /// Some task is validated but waiting for its staged writes to execute
    pub fn any_awaiting_approval(tasks: &[Task]) -> bool {
        tasks.iter().any(|t| t.state == TaskState::AwaitingApproval)
    }

    /// Mark every direct and transitive dependent of a Failed or Blocked task as
    /// Blocked. Blocking is permanent. Returns `(blocked_id, blocked_by)` pairs
    /// in the order they were blocked.
    pub fn block_dependents(tasks: &mut [Task]) -> Vec<(String, String)> {
        let mut newly_blocked = Vec::new();
        loop {
            let dead: HashSet<String> = tasks
                .iter()
                .filter(|t| matches!(t.state, TaskState::Failed | TaskState::Blocked))
                .map(|t| t.id.clone())
                .collect();

            let mut changed = false;
            for task in tasks.iter_mut() {
                if !matches!(task.state, TaskState::Pending | TaskState::Runnable) {
                    continue;
                }
                if let Some(dep) = task.dependencies.iter().find(|dep| dead.contains(*dep)) {
                    task.state = TaskState::Blocked;
                    task.error_message = Some(format!("Blocked by failed dependency {}", dep));
                    newly_blocked.push((task.id.clone(), dep.clone()));
                    changed = true;
                }
            }
            if !changed {
                return newly_blocked;
            }
        }
    }

    /// A topological order of the plan (Kahn's algorithm, ties broken by plan
    /// order), or the cycle that prevents one
    pub fn topological_order(tasks: &[Task]) -> Result<Vec<String>, SchedulerError> {
        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut in_degree = vec![0usize; tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                if let Some(&d) = index.get(dep.as_str()) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(tasks.len());
        while let Some(i) = ready.pop_front() {
            order.push(tasks[i].id.clone());
            let mut unlocked = Vec::new();
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    unlocked.push(next);
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
            ready.make_contiguous().sort_unstable();
        }

        if order.len() == tasks.len() {
            Ok(order)
        } else {
            Err(SchedulerError::CycleDetected {
                path: Self::detect_cycle(tasks).unwrap_or_default(),
            })
        }
    }

    /// First cycle reachable in plan order, as a closed path (`a -> b -> a`).
    /// Dependencies that name unknown tasks are ignored here.
    pub fn detect_cycle(tasks: &[Task]) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unseen,
            OnStack,
            Finished,
        }

        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unseen; tasks.len()];

        for root in 0..tasks.len() {
            if marks[root] != Mark::Unseen {
                continue;
            }
            // (task index, next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(frame) = stack.last_mut() {
                let (node, cursor) = *frame;
                let Some(dep) = tasks[node].dependencies.get(cursor) else {
                    marks[node] = Mark::Finished;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;
                let Some(&next) = index.get(dep.as_str()) else {
                    continue;
                };
                match marks[next] {
                    Mark::Finished => {}
                    Mark::Unseen => {
                        marks[next] = Mark::OnStack;
                        stack.push((next, 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|(i, _)| *i == next).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|(i, _)| tasks[*i].id.clone()).collect();
                        path.push(tasks[next].id.clone());
                        return Some(path);
                    }
                }
            }
        }

        None
    }

    /// Validate task graph structure
    pub fn validate(tasks: &[Task], max_tasks: usize) -> Result<(), SchedulerError> {
        if tasks.is_empty() {
            return Err(SchedulerError::EmptyTaskList);
        }

        if tasks.len() > max_tasks {
            return Err(SchedulerError::TooManyTasks {
                count: tasks.len(),
                max: max_tasks,
            });
        }

        let task_ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        if task_ids.len() != tasks.len() {
            return Err(SchedulerError::DuplicateTaskId);
        }

        for task in tasks {
            for dep in &task.dependencies {
                if !task_ids.contains(dep.as_str()) {
                    return Err(SchedulerError::InvalidDependency {
                        task_id: task.id.clone(),
                        dependency_id: dep.clone(),
                    });
                }
            }
        }

        Self::topological_order(tasks).map(|_| ())
    }

    /// Get task progress summary
    pub fn get_progress(tasks: &[Task]) -> TaskProgress {
        let mut progress = TaskProgress::default();

        for task in tasks {
            match task.state {
                TaskState::Pending => progress.pending += 1,
                TaskState::Runnable => progress.runnable += 1,
                TaskState::Running => progress.running += 1,
                TaskState::Blocked => progress.blocked += 1,
                TaskState::AwaitingApproval => progress.awaiting_approval += 1,
                TaskState::Done => progress.done += 1,
                TaskState::Failed => progress.failed += 1,
            }
        }

        progress.total = tasks.len();
        progress
    }
}

/// Reasons a plan cannot be scheduled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Plan contains no tasks")]
    EmptyTaskList,
    #[error("Plan has {count} tasks, the limit is {max}")]
    TooManyTasks { count: usize, max: usize },
    #[error("Plan reuses a task id")]
    DuplicateTaskId,
    #[error("Task '{task_id}' depends on unknown task '{dependency_id}'")]
    InvalidDependency {
        task_id: String,
        dependency_id: String,
    },
    #[error("Dependency cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

impl From<SchedulerError> for OrchestratorError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::CycleDetected { path } => OrchestratorError::CyclicDependency { path },
            other => OrchestratorError::InvalidPlan(other.to_string()),
        }
    }
}

/// Task progress summary
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskProgress {
    pub total: usize,
    pub pending: usize,
    pub runnable: usize,
    pub running: usize,
    pub blocked: usize,
    pub awaiting_approval: usize,
    pub done: usize,
    pub failed: usize,
}

impl TaskProgress {
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task(id: &str, deps: Vec<&str>, state: TaskState) -> Task {
        let mut task = Task::new(id, format!("Task {}", id), "");
        task.dependencies = deps.into_iter().map(String::from).collect();
        task.state = state;
        task
    }

    #[test]
    fn test_get_next_runnable() {
        let tasks = vec![
            make_task("1", vec![], TaskState::Done),
            make_task("2", vec!["1"], TaskState::Pending),
            make_task("3", vec!["2"], TaskState::Pending),
        ];

        let next = TaskScheduler::get_next_runnable(&tasks);
        assert_eq!(next.map(|t| t.id.as_str()), Some("2"));
    }

    #[test]
    fn test_get_next_runnable_skips_running() {
        let tasks = vec![
            make_task("1", vec![], TaskState::Running),
            make_task("2", vec![], TaskState::Runnable),
        ];
        assert_eq!(TaskScheduler::get_next_runnable(&tasks).unwrap().id, "2");
    }

    #[test]
    fn test_runnable_ties_follow_plan_order() {
        let tasks = vec![
            make_task("b", vec![], TaskState::Pending),
            make_task("a", vec![], TaskState::Pending),
            make_task("c", vec!["a", "b"], TaskState::Pending),
        ];
        let ids: Vec<&str> = TaskScheduler::get_all_runnable(&tasks)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_refresh_runnable() {
        let mut tasks = vec![
            make_task("1", vec![], TaskState::Done),
            make_task("2", vec!["1"], TaskState::Pending),
            make_task("3", vec!["2"], TaskState::Pending),
        ];
        assert_eq!(TaskScheduler::refresh_runnable(&mut tasks), vec!["2"]);
        assert_eq!(tasks[1].state, TaskState::Runnable);
        assert_eq!(tasks[2].state, TaskState::Pending);
    }

    #[test]
    fn test_all_completed() {
        let tasks_incomplete = vec![
            make_task("1", vec![], TaskState::Done),
            make_task("2", vec![], TaskState::Pending),
        ];
        assert!(!TaskScheduler::all_completed(&tasks_incomplete));

        let tasks_complete = vec![
            make_task("1", vec![], TaskState::Done),
            make_task("2", vec![], TaskState::Done),
        ];
        assert!(TaskScheduler::all_completed(&tasks_complete));
    }

    #[test]
    fn test_detect_cycle() {
        let tasks_no_cycle = vec![
            make_task("1", vec![], TaskState::Pending),
            make_task("2", vec!["1"], TaskState::Pending),
            make_task("3", vec!["2"], TaskState::Pending),
        ];
        assert!(TaskScheduler::detect_cycle(&tasks_no_cycle).is_none());

        // Cycle: 1 -> 3 -> 2 -> 1
        let tasks_cycle = vec![
            make_task("1", vec!["3"], TaskState::Pending),
            make_task("2", vec!["1"], TaskState::Pending),
            make_task("3", vec!["2"], TaskState::Pending),
        ];
        assert_eq!(
            TaskScheduler::detect_cycle(&tasks_cycle),
            Some(vec!["1".to_string(), "3".to_string(), "2".to_string(), "1".to_string()])
        );
    }

    #[test]
    fn test_cycle_path_excludes_acyclic_prefix() {
        let tasks = vec![
            make_task("entry", vec!["x"], TaskState::Pending),
            make_task("x", vec!["y"], TaskState::Pending),
            make_task("y", vec!["x"], TaskState::Pending),
        ];
        let cycle = TaskScheduler::detect_cycle(&tasks).unwrap();
        assert_eq!(cycle, vec!["x", "y", "x"]);
    }

    #[test]
    fn test_topological_order() {
        let tasks = vec![
            make_task("c", vec!["a", "b"], TaskState::Pending),
            make_task("a", vec![], TaskState::Pending),
            make_task("b", vec!["a"], TaskState::Pending),
        ];
        let order = TaskScheduler::topological_order(&tasks).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);

        let position = |id: &str| order.iter().position(|x| x == id).unwrap();
        for task in &tasks {
            for dep in &task.dependencies {
                assert!(position(dep) < position(&task.id));
            }
        }
    }

    #[test]
    fn test_validate() {
        let valid_tasks = vec![
            make_task("1", vec![], TaskState::Pending),
            make_task("2", vec!["1"], TaskState::Pending),
        ];
        assert!(TaskScheduler::validate(&valid_tasks, 12).is_ok());

        let empty_tasks: Vec<Task> = vec![];
        assert!(matches!(
            TaskScheduler::validate(&empty_tasks, 12),
            Err(SchedulerError::EmptyTaskList)
        ));

        let invalid_dep = vec![make_task("1", vec!["nonexistent"], TaskState::Pending)];
        assert!(matches!(
            TaskScheduler::validate(&invalid_dep, 12),
            Err(SchedulerError::InvalidDependency { .. })
        ));

        assert!(matches!(
            TaskScheduler::validate(&valid_tasks, 1),
            Err(SchedulerError::TooManyTasks { count: 2, max: 1 })
        ));

        let self_loop = vec![make_task("1", vec!["1"], TaskState::Pending)];
        let err: OrchestratorError = TaskScheduler::validate(&self_loop, 12).unwrap_err().into();
        assert!(matches!(err, OrchestratorError::CyclicDependency { .. }));
    }

    #[test]
    fn test_block_dependents_is_transitive_and_permanent() {
        let mut tasks = vec![
            make_task("1", vec![], TaskState::Failed),
            make_task("2", vec!["1"], TaskState::Pending),
            make_task("3", vec!["2"], TaskState::Pending),
            make_task("4", vec![], TaskState::Pending),
        ];

        let blocked = TaskScheduler::block_dependents(&mut tasks);

        assert_eq!(
            blocked,
            vec![
                ("2".to_string(), "1".to_string()),
                ("3".to_string(), "2".to_string())
            ]
        );
        assert_eq!(tasks[1].state, TaskState::Blocked);
        assert_eq!(tasks[2].state, TaskState::Blocked);
        assert_eq!(tasks[3].state, TaskState::Pending);

        // a blocked task never becomes runnable again
        assert!(TaskScheduler::refresh_runnable(&mut tasks).contains(&"4".to_string()));
        assert_eq!(tasks[1].state, TaskState::Blocked);
        assert!(TaskScheduler::get_all_runnable(&tasks).iter().all(|t| t.id == "4"));
    }

    #[test]
    fn test_is_settled() {
        let tasks = vec![
            make_task("1", vec![], TaskState::Failed),
            make_task("2", vec!["1"], TaskState::Blocked),
            make_task("3", vec![], TaskState::Done),
        ];
        assert!(TaskScheduler::is_settled(&tasks));
        assert!(TaskScheduler::any_failed(&tasks));

        let progress = TaskScheduler::get_progress(&tasks);
        assert_eq!(progress.blocked, 1);
        assert_eq!(progress.done, 1);
    }

    #[test]
    fn test_held_task_keeps_dependents_waiting() {
        let mut tasks = vec![
            make_task("1", vec![], TaskState::AwaitingApproval),
            make_task("2", vec!["1"], TaskState::Pending),
        ];
        assert!(TaskScheduler::any_awaiting_approval(&tasks));
        assert!(!TaskScheduler::is_settled(&tasks));
        assert!(TaskScheduler::refresh_runnable(&mut tasks).is_empty());
        assert!(TaskScheduler::get_next_runnable(&tasks).is_none());
        assert_eq!(TaskScheduler::get_progress(&tasks).awaiting_approval, 1);

        tasks[0].state = TaskState::Done;
        assert!(!TaskScheduler::any_awaiting_approval(&tasks));
        assert_eq!(TaskScheduler::get_next_runnable(&tasks).unwrap().id, "2");
    }
}
