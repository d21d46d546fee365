#![cfg_attr(all(test, coverage_nightly), coverage(off))]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{TaskDependency, TaskGroup, TaskHandle, TaskParams, TaskPool, TaskValue};

/// Thread counts every scheduling test runs under; 0 is the cooperative
/// same-thread mode.
const THREAD_COUNTS: [u32; 3] = [0, 1, 4];

fn value_of(value: Option<TaskValue>) -> u64 {
    *value
        .expect("task produced a value")
        .downcast_ref::<u64>()
        .expect("u64 task value")
}

#[test]
fn create_and_drop() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 16);
        pool.wait_all();
        drop(pool);
    }
}

#[test]
fn single_task() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 16);
        let counter = Arc::new(AtomicU32::new(0));

        let task = {
            let counter = Arc::clone(&counter);
            pool.add("single", 1, move |_part| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(Arc::new(42u64) as TaskValue)
            })
        }
        .expect("add task");

        assert_eq!(value_of(task.wait()), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn hundred_tasks() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 128);
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..100u64)
            .map(|i| {
                let counter = Arc::clone(&counter);
                pool.add("many", 1, move |_part| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Some(Arc::new(i) as TaskValue)
                })
                .expect("add task")
            })
            .collect();

        let outputs = TaskHandle::wait_many(handles);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        for (i, output) in outputs.into_iter().enumerate() {
            assert_eq!(value_of(output), i as u64);
        }
    }
}

#[test]
fn detached_tasks_are_reclaimed() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 16);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.add("detached", 1, move |_part| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            })
            .expect("add task")
            .detach();
        }

        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}

#[test]
fn iterations_split_into_parts() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 16);
        let group = TaskGroup::new(&pool, "split", 4).expect("group");
        let output = group.dependency_add().expect("dependency");

        // 100 iterations in parts of at most 8: every iteration must run
        // exactly once, and the completion exactly once after all of them.
        let iteration_sum = Arc::new(AtomicU64::new(0));
        let part_count = Arc::new(AtomicU32::new(0));
        let completions = Arc::new(AtomicU32::new(0));

        let ok = {
            let iteration_sum = Arc::clone(&iteration_sum);
            let part_count = Arc::clone(&part_count);
            let completions = Arc::clone(&completions);
            group.add_task_with_completion(
                &TaskParams {
                    name: "sum",
                    output: Some(output),
                    iterations: 100,
                    max_iterations_per_part: 8,
                    ..TaskParams::default()
                },
                move |part| {
                    assert!(part.count <= 8);
                    for i in part.start..part.start + part.count {
                        iteration_sum.fetch_add(i as u64, Ordering::SeqCst);
                    }
                    part_count.fetch_add(1, Ordering::SeqCst);
                    None
                },
                move |_accumulated| {
                    completions.fetch_add(1, Ordering::SeqCst);
                    Some(Arc::new(7u64) as TaskValue)
                },
            )
        };
        assert!(ok);

        assert_eq!(value_of(group.dependency_wait(output)), 7);
        assert_eq!(iteration_sum.load(Ordering::SeqCst), (0..100u64).sum());
        assert_eq!(part_count.load(Ordering::SeqCst), 13);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        group.wait();
    }
}

#[test]
fn group_chain_passes_values() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 16);
        let group = TaskGroup::new(&pool, "chain", 8).expect("group");

        let source = group.dependency_add_met(Some(Arc::new(5u64))).expect("dep");
        let doubled = group.dependency_add().expect("dep");
        let squared = group.dependency_add().expect("dep");

        assert!(group.add_task(
            &TaskParams {
                name: "double",
                inputs: &[source],
                output: Some(doubled),
                ..TaskParams::default()
            },
            |part| {
                let input = *part.inputs[0]
                    .as_ref()
                    .expect("input value")
                    .downcast_ref::<u64>()
                    .expect("u64");
                Some(Arc::new(input * 2) as TaskValue)
            },
        ));
        assert!(group.add_task(
            &TaskParams {
                name: "square",
                inputs: &[doubled],
                output: Some(squared),
                ..TaskParams::default()
            },
            |part| {
                let input = *part.inputs[0]
                    .as_ref()
                    .expect("input value")
                    .downcast_ref::<u64>()
                    .expect("u64");
                Some(Arc::new(input * input) as TaskValue)
            },
        ));

        assert_eq!(value_of(group.dependency_wait(squared)), 100);
        assert!(group.dependency_set_is_met(&[source, doubled, squared]));
        group.wait();
    }
}

#[test]
fn dependency_met_happens_before_dependent_tasks() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 32);
        let group = TaskGroup::new(&pool, "ordering", 8).expect("group");

        let gate = group.dependency_add().expect("dep");
        let ran_after_gate = Arc::new(AtomicU32::new(0));
        let gate_value = Arc::new(AtomicU64::new(0));

        for _ in 0..8 {
            let ran_after_gate = Arc::clone(&ran_after_gate);
            let gate_value = Arc::clone(&gate_value);
            assert!(group.add_task(
                &TaskParams {
                    name: "gated",
                    inputs: &[gate],
                    ..TaskParams::default()
                },
                move |part| {
                    // The met value must be visible to every dependent task.
                    let input = *part.inputs[0]
                        .as_ref()
                        .expect("gate value")
                        .downcast_ref::<u64>()
                        .expect("u64");
                    gate_value.store(input, Ordering::SeqCst);
                    ran_after_gate.fetch_add(1, Ordering::SeqCst);
                    None
                },
            ));
        }

        let (total, waiting) = group.task_count();
        assert_eq!(total, 8);
        assert_eq!(waiting, 8);
        assert!(!group.dependency_is_met(gate));

        group.dependency_met(gate, Some(Arc::new(99u64)));
        group.wait();

        assert_eq!(ran_after_gate.load(Ordering::SeqCst), 8);
        assert_eq!(gate_value.load(Ordering::SeqCst), 99);
        assert!(group.dependency_is_met(gate));
        assert_eq!(value_of(group.dependency_get(gate)), 99);
    }
}

#[test]
fn waiting_task_moves_between_dependencies() {
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 16);
        let group = TaskGroup::new(&pool, "multi-input", 8).expect("group");

        let first = group.dependency_add().expect("dep");
        let second = group.dependency_add().expect("dep");
        let done = group.dependency_add().expect("dep");

        assert!(group.add_task(
            &TaskParams {
                name: "join",
                inputs: &[first, second],
                output: Some(done),
                ..TaskParams::default()
            },
            |part| {
                let a = *part.inputs[0]
                    .as_ref()
                    .expect("first")
                    .downcast_ref::<u64>()
                    .expect("u64");
                let b = *part.inputs[1]
                    .as_ref()
                    .expect("second")
                    .downcast_ref::<u64>()
                    .expect("u64");
                Some(Arc::new(a + b) as TaskValue)
            },
        ));

        // Meeting only the first input re-parks the task on the second.
        group.dependency_met(first, Some(Arc::new(1u64)));
        assert!(!group.dependency_is_met(done));

        group.dependency_met(second, Some(Arc::new(2u64)));
        assert_eq!(value_of(group.dependency_wait(done)), 3);
        group.wait();
    }
}

#[test]
fn group_tree() {
    // A reduction tree: leaves produce their index, inner nodes sum their
    // two children, and the root must see the total.
    for threads in THREAD_COUNTS {
        let pool = TaskPool::new(threads, 64);
        let group = TaskGroup::new(&pool, "tree", 32).expect("group");

        let leaves: Vec<TaskDependency> = (0..8u64)
            .map(|i| {
                let dep = group.dependency_add().expect("dep");
                assert!(group.add_task(
                    &TaskParams {
                        name: "leaf",
                        output: Some(dep),
                        ..TaskParams::default()
                    },
                    move |_part| Some(Arc::new(i) as TaskValue),
                ));
                dep
            })
            .collect();

        let mut level = leaves;
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let out = group.dependency_add().expect("dep");
                    assert!(group.add_task(
                        &TaskParams {
                            name: "sum",
                            inputs: pair,
                            output: Some(out),
                            ..TaskParams::default()
                        },
                        |part| {
                            let total: u64 = part
                                .inputs
                                .iter()
                                .map(|input| {
                                    *input
                                        .as_ref()
                                        .expect("child value")
                                        .downcast_ref::<u64>()
                                        .expect("u64")
                                })
                                .sum();
                            Some(Arc::new(total) as TaskValue)
                        },
                    ));
                    out
                })
                .collect();
        }

        assert_eq!(value_of(group.dependency_wait(level[0])), (0..8u64).sum());
        group.wait();
    }
}

#[test]
fn blocked_group_defers_scheduling() {
    // Cooperative mode makes "has not run yet" deterministic.
    let pool = TaskPool::new(0, 16);
    let group = TaskGroup::new(&pool, "blocked", 4).expect("group");
    let counter = Arc::new(AtomicU32::new(0));

    group.block();
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        assert!(group.add_task(&TaskParams::default(), move |_part| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        }));
    }
    // Eligible tasks accumulate while the group is blocked.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    let (total, waiting) = group.task_count();
    assert_eq!((total, waiting), (4, 0));

    group.unblock();
    group.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn blocked_group_with_threads() {
    let pool = TaskPool::new(4, 16);
    let group = TaskGroup::new(&pool, "blocked-mt", 4).expect("group");
    let counter = Arc::new(AtomicU32::new(0));

    group.block();
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        assert!(group.add_task(&TaskParams::default(), move |_part| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        }));
    }
    group.unblock();
    group.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn dependency_capacity_is_bounded() {
    let pool = TaskPool::new(0, 16);
    let group = TaskGroup::new(&pool, "bounded", 2).expect("group");
    assert!(group.dependency_add().is_some());
    assert!(group.dependency_add().is_some());
    assert!(group.dependency_add().is_none());

    // Dependencies outside the group are rejected at add time.
    let other = TaskGroup::new(&pool, "other", 8).expect("group");
    for _ in 0..3 {
        assert!(other.dependency_add().is_some());
    }
    assert!(!group.add_task(
        &TaskParams {
            inputs: &[TaskDependency(2)],
            ..TaskParams::default()
        },
        |_part| None,
    ));
}

#[test]
fn tasks_spawned_from_tasks() {
    for threads in THREAD_COUNTS {
        let pool = Arc::new(TaskPool::new(threads, 32));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let inner_pool = Arc::clone(&pool);
                let counter = Arc::clone(&counter);
                pool.add("outer", 1, move |_part| {
                    let counter = Arc::clone(&counter);
                    inner_pool
                        .add("inner", 1, move |_part| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            None
                        })
                        .expect("add inner")
                        .detach();
                    None
                })
                .expect("add outer")
            })
            .collect();

        for output in TaskHandle::wait_many(handles) {
            assert!(output.is_none());
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
