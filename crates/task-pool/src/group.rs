use std::sync::Arc;

use tracing::error;

use crate::pool::{CompletionFn, Shared, Task, TaskPart, TaskPool, TaskState};
use crate::{MAX_DEPENDENCIES, TaskValue};

/// Identifies one of the dependencies in a [`TaskGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDependency(pub(crate) u32);

/// Parameters for a task added to a group.
pub struct TaskParams<'a> {
    pub name: &'static str,
    /// Dependencies that must be met before the task can run.
    pub inputs: &'a [TaskDependency],
    /// Dependency met (with the task's output value) when the task is done.
    pub output: Option<TaskDependency>,
    /// Number of 'things' that comprise this task.
    pub iterations: u32,
    /// Largest slice handled by one work-function call; 0 disables
    /// splitting.
    pub max_iterations_per_part: u32,
}

impl Default for TaskParams<'_> {
    fn default() -> Self {
        Self {
            name: "",
            inputs: &[],
            output: None,
            iterations: 1,
            max_iterations_per_part: 0,
        }
    }
}

pub(crate) struct GroupState {
    #[allow(dead_code)] // used in debug dumps
    pub(crate) name: &'static str,
    reserved: u32,
    /// Number of allocated dependencies.
    count: u32,
    /// Bitmap of met dependencies.
    met: Vec<u64>,
    /// Per-dependency value; valid only when the met bit is set.
    values: Vec<Option<TaskValue>>,
    /// Per-dependency list of waiting tasks. A task with several unmet
    /// inputs sits on the list of the lowest one.
    pub(crate) waiting: Vec<Vec<usize>>,
    pub(crate) blocked: bool,
    pub(crate) blocked_tasks: Vec<usize>,
    /// Tasks remaining in this group.
    pub(crate) tasks_count: u32,
}

impl GroupState {
    pub(crate) fn is_met(&self, dep: u32) -> bool {
        self.met[(dep / 64) as usize] & (1u64 << (dep % 64)) != 0
    }

    pub(crate) fn set_met(&mut self, dep: u32, value: Option<TaskValue>) {
        self.met[(dep / 64) as usize] |= 1u64 << (dep % 64);
        self.values[dep as usize] = value;
    }

    pub(crate) fn value(&self, dep: u32) -> Option<TaskValue> {
        debug_assert!(self.is_met(dep));
        self.values[dep as usize].clone()
    }

    /// The lowest-numbered unmet dependency among `inputs`, if any.
    pub(crate) fn lowest_unmet(&self, inputs: &[u32]) -> Option<u32> {
        inputs.iter().copied().filter(|&dep| !self.is_met(dep)).min()
    }
}

/// A collection of tasks connected by dependencies, living in a [`TaskPool`].
///
/// Dropping the group requires all of its tasks to have completed; a group
/// dropped with tasks outstanding logs an error and leaks its slot rather
/// than invalidating them.
pub struct TaskGroup {
    shared: Arc<Shared>,
    id: usize,
}

impl TaskGroup {
    /// Creates a group able to hold up to `max_dependencies` dependencies.
    pub fn new(pool: &TaskPool, name: &'static str, max_dependencies: u32) -> Option<TaskGroup> {
        if max_dependencies > MAX_DEPENDENCIES {
            return None;
        }
        let shared = Arc::clone(&pool.shared);
        let id = {
            let mut state = shared.lock_state();
            state.alloc_group(GroupState {
                name,
                reserved: max_dependencies,
                count: 0,
                met: vec![0u64; max_dependencies.div_ceil(64) as usize],
                values: vec![None; max_dependencies as usize],
                waiting: (0..max_dependencies).map(|_| Vec::new()).collect(),
                blocked: false,
                blocked_tasks: Vec::new(),
                tasks_count: 0,
            })
        };
        Some(TaskGroup { shared, id })
    }

    /// Adds a task to the group. Returns false when an input or output
    /// dependency is out of range.
    pub fn add_task(
        &self,
        params: &TaskParams<'_>,
        work: impl Fn(&TaskPart) -> Option<TaskValue> + Send + Sync + 'static,
    ) -> bool {
        self.add_task_impl(params, Arc::new(work), None)
    }

    /// As [`TaskGroup::add_task`], with a completion function that runs
    /// exactly once after the last part finishes. Its return value becomes
    /// the task output.
    pub fn add_task_with_completion(
        &self,
        params: &TaskParams<'_>,
        work: impl Fn(&TaskPart) -> Option<TaskValue> + Send + Sync + 'static,
        completion: impl FnOnce(Option<TaskValue>) -> Option<TaskValue> + Send + 'static,
    ) -> bool {
        self.add_task_impl(params, Arc::new(work), Some(Box::new(completion)))
    }

    fn add_task_impl(
        &self,
        params: &TaskParams<'_>,
        work: Arc<dyn Fn(&TaskPart) -> Option<TaskValue> + Send + Sync>,
        completion: Option<CompletionFn>,
    ) -> bool {
        {
            let mut state = self.shared.lock_state();
            let (dependency_count, group_name) = {
                let group = state.groups[self.id].as_ref().expect("live group");
                (group.count, group.name)
            };
            let in_range = params
                .inputs
                .iter()
                .chain(params.output.as_ref())
                .all(|dep| dep.0 < dependency_count);
            if !in_range {
                error!(group = group_name, "task dependency out of range");
                return false;
            }

            let id = state.alloc_task(Task {
                name: params.name,
                group: Some(self.id),
                work,
                completion,
                inputs: params.inputs.iter().map(|dep| dep.0).collect(),
                output: params.output.map(|dep| dep.0),
                iterations_total: params.iterations,
                max_iterations_per_part: params.max_iterations_per_part,
                iterations_completed: 0,
                parts_remaining: 0,
                active_parts: 0,
                state: TaskState::Waiting,
                detached: true,
                output_value: None,
            });
            state.groups[self.id]
                .as_mut()
                .expect("live group")
                .tasks_count += 1;
            self.shared.place_task(&mut state, id);
        }
        self.shared.drain_cooperative();
        true
    }

    /// Allocates the next dependency, unmet.
    pub fn dependency_add(&self) -> Option<TaskDependency> {
        let mut state = self.shared.lock_state();
        let group = state.groups[self.id].as_mut().expect("live group");
        if group.count == group.reserved {
            return None;
        }
        let dep = group.count;
        group.count += 1;
        Some(TaskDependency(dep))
    }

    /// Allocates the next dependency, already met with `value`.
    pub fn dependency_add_met(&self, value: Option<TaskValue>) -> Option<TaskDependency> {
        let dep = {
            let mut state = self.shared.lock_state();
            let group = state.groups[self.id].as_mut().expect("live group");
            if group.count == group.reserved {
                return None;
            }
            let dep = group.count;
            group.count += 1;
            group.set_met(dep, value);
            TaskDependency(dep)
        };
        Some(dep)
    }

    /// Supplies the value of a dependency and marks it met, scheduling any
    /// tasks this unblocks.
    pub fn dependency_met(&self, dep: TaskDependency, value: Option<TaskValue>) {
        {
            let mut state = self.shared.lock_state();
            self.shared
                .dependency_met_locked(&mut state, self.id, dep.0, value);
        }
        self.shared.drain_cooperative();
    }

    pub fn dependency_is_met(&self, dep: TaskDependency) -> bool {
        let state = self.shared.lock_state();
        state.groups[self.id].as_ref().expect("live group").is_met(dep.0)
    }

    /// True when every dependency in `deps` has been met.
    pub fn dependency_set_is_met(&self, deps: &[TaskDependency]) -> bool {
        let state = self.shared.lock_state();
        let group = state.groups[self.id].as_ref().expect("live group");
        deps.iter().all(|dep| group.is_met(dep.0))
    }

    /// The value of a met dependency. Panics when the dependency is unmet.
    pub fn dependency_get(&self, dep: TaskDependency) -> Option<TaskValue> {
        let state = self.shared.lock_state();
        let group = state.groups[self.id].as_ref().expect("live group");
        assert!(group.is_met(dep.0), "dependency_get on unmet dependency");
        group.value(dep.0)
    }

    /// The value of a dependency, waiting until it is met if necessary.
    pub fn dependency_wait(&self, dep: TaskDependency) -> Option<TaskValue> {
        let mut state = self.shared.lock_state();
        loop {
            {
                let group = state.groups[self.id].as_ref().expect("live group");
                if group.is_met(dep.0) {
                    return group.value(dep.0);
                }
            }
            if self.shared.thread_count == 0 {
                state = self
                    .shared
                    .run_one_ready(state)
                    .expect("cooperative pool cannot meet the awaited dependency");
                continue;
            }
            state = self.shared.wait_completed(state);
        }
    }

    /// Stops newly eligible tasks from being scheduled, so a whole subgraph
    /// can be built before the workers see any of it.
    pub fn block(&self) {
        let mut state = self.shared.lock_state();
        state.groups[self.id].as_mut().expect("live group").blocked = true;
    }

    /// Schedules everything accumulated while the group was blocked.
    pub fn unblock(&self) {
        {
            let mut state = self.shared.lock_state();
            let group = state.groups[self.id].as_mut().expect("live group");
            group.blocked = false;
            let blocked = std::mem::take(&mut group.blocked_tasks);
            for task_id in blocked {
                self.shared.place_task(&mut state, task_id);
            }
        }
        self.shared.drain_cooperative();
    }

    /// Waits for the group to have no remaining tasks.
    pub fn wait(&self) {
        let mut state = self.shared.lock_state();
        loop {
            if state.groups[self.id].as_ref().expect("live group").tasks_count == 0 {
                return;
            }
            if self.shared.thread_count == 0 {
                state = self
                    .shared
                    .run_one_ready(state)
                    .expect("cooperative pool cannot finish the group");
                continue;
            }
            state = self.shared.wait_completed(state);
        }
    }

    /// Number of tasks remaining in the group, and how many of those are
    /// still waiting for dependencies.
    pub fn task_count(&self) -> (u32, u32) {
        let state = self.shared.lock_state();
        let group = state.groups[self.id].as_ref().expect("live group");
        let waiting = group
            .waiting
            .iter()
            .map(|list| list.len() as u32)
            .sum::<u32>();
        (group.tasks_count, waiting)
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        let group = state.groups[self.id].as_ref().expect("live group");
        if group.tasks_count != 0 {
            error!(
                name = group.name,
                tasks = group.tasks_count,
                "task group dropped with tasks outstanding"
            );
            return;
        }
        state.free_group(self.id);
    }
}
