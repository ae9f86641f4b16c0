//! qcoro 演示程序
//!
//! 用法: qcoro-demo [fifo|await|pool|all]
//!
//! 配置从 QCORO_* 环境变量读取，日志级别由 RUST_LOG 控制。

use std::env;
use std::io;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use qcoro::config::VERSION;
use qcoro::runtime::{CoroutineManagerConfig, CoroutineStateInfo, Runtime};
use qcoro::{CompletionEvent, CoroutineEvent, FnMethod, LaunchError, StackfulCoroutineManager, Value};

fn print_usage() {
    println!("qcoro {}", VERSION);
    println!();
    println!("Usage: qcoro-demo [scenario]");
    println!();
    println!("Scenarios:");
    println!("  fifo   three coroutines yield in turn");
    println!("  await  a coroutine blocks on an event set by the main coroutine");
    println!("  pool   finished coroutines are reused by later launches");
    println!("  all    run every scenario (default)");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let scenario = env::args().nth(1).unwrap_or_else(|| "all".to_string());
    let result = match scenario.as_str() {
        "fifo" => run_fifo(),
        "await" => run_await(),
        "pool" => run_pool(),
        "all" => run_fifo().and_then(|_| run_await()).and_then(|_| run_pool()),
        "help" | "-h" | "--help" => {
            print_usage();
            return;
        }
        other => {
            eprintln!("unknown scenario: {}", other);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn dump_state(manager: &StackfulCoroutineManager) {
    let info = CoroutineStateInfo::capture(manager);
    if let Err(err) = info.output_info(&mut io::stdout().lock()) {
        eprintln!("failed to print coroutine state: {}", err);
    }
}

// ============================================================================
// 场景
// ============================================================================

/// 三个协程在单个 worker 上轮流让出
fn run_fifo() -> Result<(), LaunchError> {
    println!("== fifo ==");
    let config = CoroutineManagerConfig::from_env().with_workers(1);
    let log = Arc::new(Mutex::new(Vec::new()));

    Runtime::new(config).run(|manager| -> Result<(), LaunchError> {
        let mut completions = Vec::new();
        for name in ["A", "B", "C"] {
            let log = Arc::clone(&log);
            let method = FnMethod::new(name, move |manager: &StackfulCoroutineManager, _: &[Value]| {
                for _ in 0..2 {
                    log.lock().push(name);
                    manager.schedule();
                }
                Value::Undefined
            });
            let completion = Arc::new(CompletionEvent::new());
            manager.launch(Arc::clone(&completion), method, Vec::new())?;
            completions.push(completion);
        }
        dump_state(manager);

        for completion in &completions {
            let guard = completion.event().lock();
            manager.await_event(completion.event(), guard);
        }
        info!(order = ?log.lock(), "all coroutines finished");
        println!("order: {}", log.lock().join(" "));
        Ok(())
    })
}

/// 协程阻塞在事件上，主协程稍后设置事件并唤醒它
fn run_await() -> Result<(), LaunchError> {
    println!("== await ==");
    let config = CoroutineManagerConfig::from_env().with_workers(1);
    let event = Arc::new(CoroutineEvent::new());

    Runtime::new(config).run(|manager| -> Result<(), LaunchError> {
        let waited = Arc::clone(&event);
        let method = FnMethod::new("waiter", move |manager: &StackfulCoroutineManager, _: &[Value]| {
            let guard = waited.lock();
            let blocked = manager.await_event(&waited, guard);
            Value::from(blocked)
        });
        let completion = Arc::new(CompletionEvent::new());
        let co = manager.launch(Arc::clone(&completion), method, Vec::new())?;

        manager.schedule();
        println!("waiter status after schedule: {:?}", co.status());
        dump_state(manager);

        thread::sleep(Duration::from_millis(5));
        event.set_happened();
        manager.unblock_waiters(&event);
        println!("waiter status after unblock: {:?}", co.status());

        let guard = completion.event().lock();
        manager.await_event(completion.event(), guard);
        println!("waiter result: {}", completion.result().unwrap_or_default());
        Ok(())
    })
}

/// 开启协程池后，已结束的协程被后续启动复用
fn run_pool() -> Result<(), LaunchError> {
    println!("== pool ==");
    let config = CoroutineManagerConfig::from_env().with_workers(1).with_pool(16);

    Runtime::new(config).run(|manager| -> Result<(), LaunchError> {
        let method = FnMethod::new("short", |_: &StackfulCoroutineManager, args: &[Value]| {
            args.first().cloned().unwrap_or_default()
        });

        for i in 0..4 {
            manager.launch(Arc::new(CompletionEvent::new()), method.clone(), vec![Value::from(i)])?;
        }
        // 主协程 + 调度循环
        while manager.coroutine_count() > 2 {
            manager.schedule();
        }
        let allocated = manager.stacks_allocated();
        println!("pool size: {}, stacks allocated: {}", manager.pool_size(), allocated);

        let completion = Arc::new(CompletionEvent::new());
        manager.launch(Arc::clone(&completion), method, vec![Value::from(99)])?;
        let guard = completion.event().lock();
        manager.await_event(completion.event(), guard);
        println!(
            "reused: {}, result: {}",
            manager.stacks_allocated() == allocated,
            completion.result().unwrap_or_default()
        );
        dump_state(manager);
        Ok(())
    })
}
