//! Gates shared by async tasks.

use std::time::Duration;

use qpsgate::ratelimit::{GateHandle, GateRegistry, Rule};

#[tokio::test]
async fn test_guard_held_across_await() {
    let handle = GateHandle::load(Rule::new("async", 1000, 2, 10)).unwrap();

    let task = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let guard = handle.entry_guard();
            let admitted = guard.is_admitted();
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
            admitted
        })
    };

    assert!(task.await.unwrap());
    let stats = handle.stats();
    assert_eq!(stats.pass, 1);
    assert_eq!(stats.success, 1);
    assert!(stats.avg_rt >= 10.0, "avg_rt = {}", stats.avg_rt);
}

#[tokio::test]
async fn test_many_tasks_share_a_registry_gate() {
    let registry = GateRegistry::from_rules(vec![Rule::new("tasks", 1000, 2, 50)]).unwrap();
    let handle = registry.get("tasks").unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut admitted = 0u64;
                for _ in 0..10 {
                    if handle.run(|| ()).is_some() {
                        admitted += 1;
                    }
                    tokio::task::yield_now().await;
                }
                admitted
            })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        admitted += task.await.unwrap();
    }

    let stats = handle.stats();
    assert_eq!(stats.total_request, 200);
    assert_eq!(stats.pass, admitted);
    assert!(stats.pass >= 50);
}

#[test]
fn test_run_inside_block_on() {
    let handle = GateHandle::load(Rule::new("blocking", 1000, 2, 1)).unwrap();

    let results = tokio_test::block_on(async {
        let first = handle.run(|| "work");
        let second = handle.run(|| "work");
        (first, second)
    });

    assert_eq!(results, (Some("work"), None));
}
