//! 协程状态快照
//!
//! 调试器和诊断输出使用。每个 worker 的锁只在复制数据时短暂持有。

use std::io::{self, Write};

use super::coroutine::{CoroutineId, CoroutineStatus, CoroutineType};
use super::manager::StackfulCoroutineManager;
use super::worker::ScheduleLoopType;

/// 单个协程的状态
#[derive(Debug, Clone, PartialEq)]
pub struct CoroutineInfo {
    pub id: CoroutineId,
    pub name: String,
    pub kind: CoroutineType,
    pub status: CoroutineStatus,
    pub worker: Option<usize>,
    /// 栈范围 (低地址, 大小)，裸协程为 None
    pub stack: Option<(usize, usize)>,
    pub suspended: bool,
}

/// 单个 worker 的状态
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: usize,
    pub name: String,
    pub loop_type: ScheduleLoopType,
    pub active: bool,
    pub load_factor: f64,
    pub switch_disabled: bool,
    pub switch_count: u64,
    /// 可运行队列（按调度顺序）
    pub runnables: Vec<String>,
    /// 等待表 (事件 ID, 协程名)
    pub waiters: Vec<(u64, String)>,
    pub finalization_pending: usize,
}

/// 协程子系统的状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct CoroutineStateInfo {
    pub coroutine_count: usize,
    pub coroutine_count_limit: usize,
    pub active_workers: usize,
    pub pool_size: usize,
    pub stacks_allocated: usize,
    pub workers: Vec<WorkerInfo>,
    pub coroutines: Vec<CoroutineInfo>,
}

impl CoroutineStateInfo {
    /// 采集快照
    pub fn capture(manager: &StackfulCoroutineManager) -> Self {
        let workers = manager
            .workers()
            .iter()
            .map(|w| WorkerInfo {
                id: w.id(),
                name: w.name().to_string(),
                loop_type: w.loop_type(),
                active: w.is_active(),
                load_factor: w.load_factor(),
                switch_disabled: w.is_coroutine_switch_disabled(),
                switch_count: w.switch_count(),
                runnables: w.runnable_names(),
                waiters: w.waiter_names(),
                finalization_pending: w.finalization_len(),
            })
            .collect();

        let mut coroutines = Vec::new();
        manager.enumerate_coroutines(|co| {
            coroutines.push(CoroutineInfo {
                id: co.id(),
                name: co.name(),
                kind: co.kind(),
                status: co.status(),
                worker: co.worker(),
                stack: co.context().retrieve_stack_info().map(|s| (s.lo, s.size)),
                suspended: co.is_suspended(),
            });
            true
        });
        coroutines.sort_by_key(|c| c.id);

        Self {
            coroutine_count: manager.coroutine_count(),
            coroutine_count_limit: manager.coroutine_count_limit(),
            active_workers: manager.active_workers_count(),
            pool_size: manager.pool_size(),
            stacks_allocated: manager.stacks_allocated(),
            workers,
            coroutines,
        }
    }

    /// 指定名字的协程
    pub fn coroutine(&self, name: &str) -> Option<&CoroutineInfo> {
        self.coroutines.iter().find(|c| c.name == name)
    }

    /// 输出快照
    pub fn output_info<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "coroutines: {} / {} (pool {}, stacks allocated {}), active workers: {}",
            self.coroutine_count,
            self.coroutine_count_limit,
            self.pool_size,
            self.stacks_allocated,
            self.active_workers
        )?;

        for w in &self.workers {
            writeln!(
                out,
                "{} [{:?}] active={} lf={:.2} switches={}{}",
                w.name,
                w.loop_type,
                w.active,
                w.load_factor,
                w.switch_count,
                if w.switch_disabled { " SWITCH DISABLED" } else { "" }
            )?;
            writeln!(out, "  runnables: [{}]", w.runnables.join(", "))?;
            if !w.waiters.is_empty() {
                let waiters: Vec<_> = w
                    .waiters
                    .iter()
                    .map(|(event, name)| format!("{} on event {}", name, event))
                    .collect();
                writeln!(out, "  waiters: [{}]", waiters.join(", "))?;
            }
            if w.finalization_pending > 0 {
                writeln!(out, "  pending finalization: {}", w.finalization_pending)?;
            }
        }

        for c in &self.coroutines {
            write!(out, "#{} {} {:?} {:?}", c.id, c.name, c.kind, c.status)?;
            match c.worker {
                Some(worker) => write!(out, " on worker {}", worker)?,
                None => write!(out, " unassigned")?,
            }
            if let Some((lo, size)) = c.stack {
                write!(out, " stack {:#x}+{:#x}", lo, size)?;
            }
            if c.suspended {
                write!(out, " (suspended)")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CoroutineStateInfo {
        CoroutineStateInfo {
            coroutine_count: 3,
            coroutine_count_limit: 100,
            active_workers: 1,
            pool_size: 0,
            stacks_allocated: 2,
            workers: vec![WorkerInfo {
                id: 0,
                name: "[main] worker 0".to_string(),
                loop_type: ScheduleLoopType::Fiber,
                active: true,
                load_factor: 0.5,
                switch_disabled: false,
                switch_count: 4,
                runnables: vec!["_schedule_loop_0".to_string()],
                waiters: vec![(9, "waiter".to_string())],
                finalization_pending: 0,
            }],
            coroutines: vec![
                CoroutineInfo {
                    id: CoroutineId(1),
                    name: "_main_".to_string(),
                    kind: CoroutineType::Regular,
                    status: CoroutineStatus::Running,
                    worker: Some(0),
                    stack: None,
                    suspended: false,
                },
                CoroutineInfo {
                    id: CoroutineId(3),
                    name: "waiter".to_string(),
                    kind: CoroutineType::Regular,
                    status: CoroutineStatus::Blocked,
                    worker: Some(0),
                    stack: Some((0x1000, 0x4000)),
                    suspended: true,
                },
            ],
        }
    }

    #[test]
    fn test_output_info() {
        let mut out = Vec::new();
        sample().output_info(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("coroutines: 3 / 100"));
        assert!(text.contains("[main] worker 0 [Fiber] active=true lf=0.50 switches=4"));
        assert!(text.contains("runnables: [_schedule_loop_0]"));
        assert!(text.contains("waiter on event 9"));
        assert!(text.contains("#1 _main_ Regular Running on worker 0\n"));
        assert!(text.contains("#3 waiter Regular Blocked on worker 0 stack 0x1000+0x4000 (suspended)"));
    }

    #[test]
    fn test_lookup_by_name() {
        let info = sample();
        assert_eq!(info.coroutine("waiter").map(|c| c.status), Some(CoroutineStatus::Blocked));
        assert!(info.coroutine("missing").is_none());
    }
}
