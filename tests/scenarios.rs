//! 端到端调度场景
//!
//! 每个测试在测试框架自己的线程上创建运行时，线程即主协程。

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use qcoro::runtime::current_coroutine;
use qcoro::{
    CompletionEvent, CoroutineEvent, CoroutineManagerConfig, CoroutineStatus, FnMethod, Runtime,
    StackfulCoroutineManager, Value,
};

fn single_worker() -> CoroutineManagerConfig {
    CoroutineManagerConfig::default().with_workers(1).with_stack_size_pages(16)
}

fn await_completion(manager: &StackfulCoroutineManager, completion: &CompletionEvent) {
    let guard = completion.event().lock();
    manager.await_event(completion.event(), guard);
}

#[test]
fn test_coroutines_yield_in_fifo_order() {
    let log = Arc::new(Mutex::new(Vec::new()));

    Runtime::new(single_worker()).run(|manager| {
        let completions: Vec<_> = ["A", "B", "C"]
            .into_iter()
            .map(|name| {
                let log = Arc::clone(&log);
                let method = FnMethod::new(name, move |manager: &StackfulCoroutineManager, _: &[Value]| {
                    log.lock().push(name);
                    manager.schedule();
                    log.lock().push(name);
                    Value::Undefined
                });
                let completion = Arc::new(CompletionEvent::new());
                manager.launch(Arc::clone(&completion), method, Vec::new()).unwrap();
                completion
            })
            .collect();

        for completion in &completions {
            await_completion(manager, completion);
            assert!(completion.happened());
        }
    });

    assert_eq!(*log.lock(), vec!["A", "B", "C", "A", "B", "C"]);
}

#[test]
fn test_await_and_unblock() {
    let event = Arc::new(CoroutineEvent::new());
    let statuses = Arc::new(Mutex::new(Vec::new()));

    Runtime::new(single_worker()).run(|manager| {
        let waited = Arc::clone(&event);
        let seen = Arc::clone(&statuses);
        let method = FnMethod::new("waiter", move |manager: &StackfulCoroutineManager, _: &[Value]| {
            let guard = waited.lock();
            let blocked = manager.await_event(&waited, guard);
            seen.lock().push(current_coroutine().unwrap().status());
            Value::from(blocked)
        });
        let completion = Arc::new(CompletionEvent::new());
        let co = manager.launch(Arc::clone(&completion), method, Vec::new()).unwrap();
        statuses.lock().push(co.status());

        manager.schedule();
        statuses.lock().push(co.status());
        assert_eq!(manager.worker(0).waiter_names(), vec![(event.id(), "waiter".to_string())]);

        thread::sleep(Duration::from_millis(5));
        event.set_happened();
        manager.unblock_waiters(&event);
        statuses.lock().push(co.status());
        assert!(manager.worker(0).waiter_names().is_empty());

        await_completion(manager, &completion);
        assert_eq!(completion.result(), Some(Value::Bool(true)));
        assert_eq!(co.status(), CoroutineStatus::Finished);
    });

    assert_eq!(
        *statuses.lock(),
        vec![
            CoroutineStatus::Runnable,
            CoroutineStatus::Blocked,
            CoroutineStatus::Runnable,
            CoroutineStatus::Running,
        ]
    );
}

#[test]
fn test_pooled_coroutine_is_reused() {
    Runtime::new(single_worker().with_pool(8)).run(|manager| {
        let method = FnMethod::new("echo", |_: &StackfulCoroutineManager, args: &[Value]| {
            args.first().cloned().unwrap_or_default()
        });
        let launched: Vec<_> = (0..3)
            .map(|i| {
                manager
                    .launch(Arc::new(CompletionEvent::new()), method.clone(), vec![Value::from(i)])
                    .unwrap()
            })
            .collect();
        // 调度循环 + 3 个协程
        assert_eq!(manager.stacks_allocated(), 4);

        // 主协程 + 调度循环
        while manager.coroutine_count() > 2 {
            manager.schedule();
        }
        assert_eq!(manager.pool_size(), 3);

        let completion = Arc::new(CompletionEvent::new());
        let reused = manager
            .launch(Arc::clone(&completion), method, vec![Value::from(42)])
            .unwrap();
        assert!(launched.iter().any(|co| Arc::ptr_eq(co, &reused)));
        assert_eq!(manager.pool_size(), 2);
        assert_eq!(manager.stacks_allocated(), 4);

        await_completion(manager, &completion);
        assert_eq!(completion.result(), Some(Value::from(42)));
    });
}

#[test]
fn test_coroutine_limit_is_reported() {
    let config = single_worker().with_stack_mem_limit(16 * qcoro::runtime::stack::page_size() * 3);

    Runtime::new(config).run(|manager| {
        assert_eq!(manager.coroutine_count_limit(), 3);
        let method = FnMethod::new("idle", |_: &StackfulCoroutineManager, _: &[Value]| Value::Undefined);

        // 主协程 + 调度循环已经占了两个名额
        let first = manager.launch(Arc::new(CompletionEvent::new()), method.clone(), Vec::new());
        assert!(first.is_ok());
        let second = manager.launch(Arc::new(CompletionEvent::new()), method, Vec::new());
        assert!(matches!(
            second,
            Err(qcoro::LaunchError::CoroutineLimitReached { limit: 3 })
        ));
    });
}
