use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::error;

use crate::TaskValue;
use crate::group::GroupState;

pub(crate) type WorkFn = Arc<dyn Fn(&TaskPart) -> Option<TaskValue> + Send + Sync>;
pub(crate) type CompletionFn = Box<dyn FnOnce(Option<TaskValue>) -> Option<TaskValue> + Send>;

/// Describes the slice of a task that one worker invocation is responsible
/// for, along with the values of the task's input dependencies.
pub struct TaskPart {
    /// First iteration in this part.
    pub start: u32,
    /// Number of iterations in this part.
    pub count: u32,
    /// Values of the task's input dependencies, in input order.
    pub inputs: Vec<Option<TaskValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Waiting,
    Ready,
    Running,
    Blocked,
    Done,
}

pub(crate) struct Task {
    #[allow(dead_code)] // used in debug dumps
    pub(crate) name: &'static str,
    pub(crate) group: Option<usize>,
    pub(crate) work: WorkFn,
    pub(crate) completion: Option<CompletionFn>,
    /// Group dependencies required before this task can run.
    pub(crate) inputs: Vec<u32>,
    /// Group dependency met by this task once it completes.
    pub(crate) output: Option<u32>,
    pub(crate) iterations_total: u32,
    pub(crate) max_iterations_per_part: u32,
    pub(crate) iterations_completed: u32,
    /// Parts enqueued but not yet finished.
    pub(crate) parts_remaining: u32,
    /// Parts currently being executed.
    pub(crate) active_parts: u32,
    pub(crate) state: TaskState,
    pub(crate) detached: bool,
    pub(crate) output_value: Option<TaskValue>,
}

struct ReadyPart {
    task: usize,
    start: u32,
    count: u32,
}

pub(crate) struct PoolState {
    pub(crate) tasks: Vec<Option<Task>>,
    free_tasks: Vec<usize>,
    pub(crate) groups: Vec<Option<GroupState>>,
    free_groups: Vec<usize>,
    ready: VecDeque<ReadyPart>,
    /// Tasks not yet done.
    pub(crate) pending_tasks: u32,
    running: bool,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<PoolState>,
    /// Signalled when parts become ready to run.
    pub(crate) cond_ready: Condvar,
    /// Signalled when tasks complete or dependencies are met.
    pub(crate) cond_completed: Condvar,
    pub(crate) thread_count: u32,
}

type StateGuard<'a> = MutexGuard<'a, PoolState>;

/// The task pool. See the crate docs for the execution model.
pub struct TaskPool {
    pub(crate) shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

/// A standalone task that the caller will reap. Consume with
/// [`TaskHandle::wait`] or release with [`TaskHandle::detach`].
#[must_use = "non-detached tasks are reaped by wait()"]
pub struct TaskHandle {
    shared: Arc<Shared>,
    id: usize,
}

impl TaskPool {
    /// Creates a pool with `thread_count` workers (0 runs tasks cooperatively
    /// on the caller thread) and room reserved for `reserved_task_count`
    /// tasks.
    pub fn new(thread_count: u32, reserved_task_count: u32) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: Vec::with_capacity(reserved_task_count as usize),
                free_tasks: Vec::new(),
                groups: Vec::new(),
                free_groups: Vec::new(),
                ready: VecDeque::new(),
                pending_tasks: 0,
                running: true,
            }),
            cond_ready: Condvar::new(),
            cond_completed: Condvar::new(),
            thread_count,
        });

        let threads = (0..thread_count)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("lcevc-task-{i}"))
                    .spawn(move || worker(&shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self { shared, threads }
    }

    /// Adds a standalone task with no dependencies. Returns `None` when the
    /// pool is shutting down.
    pub fn add(
        &self,
        name: &'static str,
        iterations: u32,
        work: impl Fn(&TaskPart) -> Option<TaskValue> + Send + Sync + 'static,
    ) -> Option<TaskHandle> {
        let id = {
            let mut state = self.shared.lock_state();
            if !state.running {
                return None;
            }
            let id = state.alloc_task(Task {
                name,
                group: None,
                work: Arc::new(work),
                completion: None,
                inputs: Vec::new(),
                output: None,
                iterations_total: iterations,
                max_iterations_per_part: 0,
                iterations_completed: 0,
                parts_remaining: 0,
                active_parts: 0,
                state: TaskState::Waiting,
                detached: false,
                output_value: None,
            });
            self.shared.place_task(&mut state, id);
            id
        };
        self.shared.drain_cooperative();
        Some(TaskHandle {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    /// Waits until every pending task in the pool has completed.
    pub fn wait_all(&self) {
        let mut state = self.shared.lock_state();
        loop {
            if state.pending_tasks == 0 {
                return;
            }
            if self.shared.thread_count == 0 {
                state = self
                    .shared
                    .run_one_ready(state)
                    .expect("cooperative pool has pending tasks but nothing ready");
                continue;
            }
            state = self.shared.wait_completed(state);
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.running = false;
        }
        self.shared.cond_ready.notify_all();
        for thread in self.threads.drain(..) {
            thread.join().expect("pool worker panicked");
        }
    }
}

impl TaskHandle {
    /// Blocks until the task completes, reaps it, and returns its output
    /// value.
    pub fn wait(self) -> Option<TaskValue> {
        let mut state = self.shared.lock_state();
        loop {
            if self.shared.state_of(&state, self.id) == TaskState::Done {
                let output = state.tasks[self.id]
                    .as_mut()
                    .expect("live task")
                    .output_value
                    .take();
                state.free_task(self.id);
                return output;
            }
            if self.shared.thread_count == 0 {
                state = self
                    .shared
                    .run_one_ready(state)
                    .expect("cooperative pool cannot finish the awaited task");
                continue;
            }
            state = self.shared.wait_completed(state);
        }
    }

    /// Waits for a set of tasks, returning their outputs in order.
    pub fn wait_many(handles: impl IntoIterator<Item = TaskHandle>) -> Vec<Option<TaskValue>> {
        handles.into_iter().map(TaskHandle::wait).collect()
    }

    /// Indicates the task will never be waited for; its storage is reclaimed
    /// as soon as it has executed.
    pub fn detach(self) {
        let mut state = self.shared.lock_state();
        if self.shared.state_of(&state, self.id) == TaskState::Done {
            state.free_task(self.id);
        } else {
            state.tasks[self.id].as_mut().expect("live task").detached = true;
        }
    }
}

impl PoolState {
    pub(crate) fn alloc_task(&mut self, task: Task) -> usize {
        self.pending_tasks += 1;
        match self.free_tasks.pop() {
            Some(id) => {
                self.tasks[id] = Some(task);
                id
            }
            None => {
                self.tasks.push(Some(task));
                self.tasks.len() - 1
            }
        }
    }

    pub(crate) fn free_task(&mut self, id: usize) {
        self.tasks[id] = None;
        self.free_tasks.push(id);
    }

    pub(crate) fn alloc_group(&mut self, group: GroupState) -> usize {
        match self.free_groups.pop() {
            Some(id) => {
                self.groups[id] = Some(group);
                id
            }
            None => {
                self.groups.push(Some(group));
                self.groups.len() - 1
            }
        }
    }

    pub(crate) fn free_group(&mut self, id: usize) {
        self.groups[id] = None;
        self.free_groups.push(id);
    }
}

impl Shared {
    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        self.state.lock().expect("task pool mutex poisoned")
    }

    pub(crate) fn wait_completed<'a>(&'a self, guard: StateGuard<'a>) -> StateGuard<'a> {
        self.cond_completed
            .wait(guard)
            .expect("task pool mutex poisoned")
    }

    fn state_of(&self, state: &PoolState, task_id: usize) -> TaskState {
        state.tasks[task_id].as_ref().expect("live task").state
    }

    /// Routes a task whose placement may have changed: onto the waiting list
    /// of its lowest unmet dependency, the group's blocked list, or the ready
    /// queue.
    pub(crate) fn place_task(&self, state: &mut PoolState, task_id: usize) {
        let task = state.tasks[task_id].as_ref().expect("live task");
        if let Some(group_id) = task.group {
            let group = state.groups[group_id].as_ref().expect("live group");
            if let Some(dep) = group.lowest_unmet(&task.inputs) {
                state.tasks[task_id].as_mut().expect("live task").state = TaskState::Waiting;
                state.groups[group_id]
                    .as_mut()
                    .expect("live group")
                    .waiting[dep as usize]
                    .push(task_id);
                return;
            }
            if group.blocked {
                state.tasks[task_id].as_mut().expect("live task").state = TaskState::Blocked;
                state.groups[group_id]
                    .as_mut()
                    .expect("live group")
                    .blocked_tasks
                    .push(task_id);
                return;
            }
        }
        self.enqueue_task(state, task_id);
    }

    /// Marks a task ready and queues its parts.
    fn enqueue_task(&self, state: &mut PoolState, task_id: usize) {
        let task = state.tasks[task_id].as_mut().expect("live task");
        task.state = TaskState::Ready;

        let total = task.iterations_total;
        let per_part = if task.max_iterations_per_part == 0 {
            total.max(1)
        } else {
            task.max_iterations_per_part
        };

        let mut parts = 0u32;
        let mut start = 0u32;
        loop {
            let count = per_part.min(total - start);
            state.ready.push_back(ReadyPart {
                task: task_id,
                start,
                count,
            });
            parts += 1;
            start += count;
            if start >= total {
                break;
            }
        }
        state.tasks[task_id].as_mut().expect("live task").parts_remaining = parts;

        if parts == 1 {
            self.cond_ready.notify_one();
        } else {
            self.cond_ready.notify_all();
        }
    }

    /// Pops and executes one ready part, or returns `None` with the guard
    /// dropped when nothing is ready.
    pub(crate) fn run_one_ready<'a>(&'a self, mut guard: StateGuard<'a>) -> Option<StateGuard<'a>> {
        let part = guard.ready.pop_front()?;
        guard = self.execute_part(guard, part);
        Some(guard)
    }

    /// Runs every ready part on the caller. Only meaningful for cooperative
    /// pools.
    pub(crate) fn drain_cooperative(&self) {
        if self.thread_count != 0 {
            return;
        }
        let mut guard = self.lock_state();
        while let Some(part) = guard.ready.pop_front() {
            guard = self.execute_part(guard, part);
        }
    }

    /// Runs a part with the lock released, then folds its result back in and
    /// finalizes the task when this was its last part.
    fn execute_part<'a>(&'a self, mut guard: StateGuard<'a>, part: ReadyPart) -> StateGuard<'a> {
        let (work, task_part) = {
            let state = &mut *guard;
            let task = state.tasks[part.task].as_mut().expect("live task");
            task.state = TaskState::Running;
            task.active_parts += 1;

            let inputs = match task.group {
                Some(group_id) => {
                    let group = state.groups[group_id].as_ref().expect("live group");
                    task.inputs
                        .iter()
                        .map(|&dep| group.value(dep))
                        .collect()
                }
                None => Vec::new(),
            };

            (
                Arc::clone(&task.work),
                TaskPart {
                    start: part.start,
                    count: part.count,
                    inputs,
                },
            )
        };

        drop(guard);
        let result = (work)(&task_part);
        let mut guard = self.lock_state();

        let finished = {
            let task = guard.tasks[part.task].as_mut().expect("live task");
            if let Some(value) = result {
                task.output_value = Some(value);
            }
            task.iterations_completed += part.count;
            task.active_parts -= 1;
            task.parts_remaining -= 1;
            task.parts_remaining == 0 && task.active_parts == 0
        };

        if finished {
            guard = self.finalize_task(guard, part.task);
        }
        guard
    }

    /// Runs the completion function (outside the lock), marks the task done,
    /// meets its output dependency and reclaims detached storage. Happens
    /// exactly once per task.
    fn finalize_task<'a>(&'a self, mut guard: StateGuard<'a>, task_id: usize) -> StateGuard<'a> {
        let completion = guard.tasks[task_id]
            .as_mut()
            .expect("live task")
            .completion
            .take();
        if let Some(completion) = completion {
            let accumulated = guard.tasks[task_id]
                .as_mut()
                .expect("live task")
                .output_value
                .take();
            drop(guard);
            let result = completion(accumulated);
            guard = self.lock_state();
            guard.tasks[task_id].as_mut().expect("live task").output_value = result;
        }

        let (group, output, output_value) = {
            let state = &mut *guard;
            let (group, output, output_value, detached) = {
                let task = state.tasks[task_id].as_mut().expect("live task");
                task.state = TaskState::Done;
                (
                    task.group,
                    task.output,
                    task.output_value.clone(),
                    task.detached,
                )
            };
            state.pending_tasks -= 1;

            if let Some(group_id) = group {
                state.groups[group_id]
                    .as_mut()
                    .expect("live group")
                    .tasks_count -= 1;
            }
            if detached {
                state.free_task(task_id);
            }
            (group, output, output_value)
        };

        if let (Some(group_id), Some(dep)) = (group, output) {
            self.dependency_met_locked(&mut guard, group_id, dep, output_value);
        }

        self.cond_completed.notify_all();
        guard
    }

    /// Records a met dependency and re-examines every task waiting on it.
    pub(crate) fn dependency_met_locked(
        &self,
        guard: &mut StateGuard<'_>,
        group_id: usize,
        dep: u32,
        value: Option<TaskValue>,
    ) {
        let waiters = {
            let group = guard.groups[group_id].as_mut().expect("live group");
            if group.is_met(dep) {
                error!(dep, "dependency met twice");
            }
            group.set_met(dep, value);
            std::mem::take(&mut group.waiting[dep as usize])
        };

        for task_id in waiters {
            self.place_task(guard, task_id);
        }

        // Wake any dependency_wait callers.
        self.cond_completed.notify_all();
    }
}

fn worker(shared: &Shared) {
    let mut state = shared.lock_state();
    loop {
        if let Some(part) = state.ready.pop_front() {
            state = shared.execute_part(state, part);
            continue;
        }
        if !state.running {
            return;
        }
        state = shared
            .cond_ready
            .wait(state)
            .expect("task pool mutex poisoned");
    }
}
