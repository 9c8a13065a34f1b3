//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 并行任务拆分 (vmtask)
//!
//! 把 `n` 个同质单元拆成若干连续分块，每个分块交给一个工作函数：
//! - 分块不相交，恰好覆盖 `[0, n)`
//! - 每块至少 `min_chunk` 个单元（`n < min_chunk` 时只有一块）
//! - 最多 `VMTASK_MAX_TASKS` 块
//!
//! 任一分块出错后不再启动新的分块，等已启动的分块结束，
//! 再对每个已推进的范围调用补偿函数，最后返回第一个错误。

use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::VMTASK_MAX_TASKS;
use crate::errno::SptError;

/// 工作函数：处理 `[start, end)`，返回结果和实际推进到的位置
pub type Worker<'a> = dyn Fn(usize, usize) -> (Result<(), SptError>, usize) + Sync + 'a;

/// 补偿函数：撤销 `[start, next)` 上已经完成的工作
pub type Undo<'a> = dyn Fn(usize, usize) + Sync + 'a;

/// 作业分发器
///
/// `dispatch` 必须在所有作业都执行完后才返回，
/// 作业之间可以并发执行。
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, njobs: usize, job: &(dyn Fn(usize) + Sync));
}

/// 在当前线程上依次执行
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDispatcher;

impl TaskDispatcher for SerialDispatcher {
    fn dispatch(&self, njobs: usize, job: &(dyn Fn(usize) + Sync)) {
        for i in 0..njobs {
            job(i);
        }
    }
}

/// 计算分块
///
/// 余数摊到各块上，`n >= min_chunk` 时每块至少 `min_chunk` 个单元。
pub fn split(n: usize, min_chunk: usize) -> Vec<Range<usize>> {
    if n == 0 {
        return Vec::new();
    }
    let min_chunk = min_chunk.max(1);
    let nchunks = (n / min_chunk).clamp(1, VMTASK_MAX_TASKS.max(1));

    (0..nchunks)
        .map(|i| i * n / nchunks..(i + 1) * n / nchunks)
        .collect()
}

/// 执行作业
///
/// 对应 `vmtask_run_job()`
pub fn run_job(
    dispatcher: &dyn TaskDispatcher,
    n: usize,
    min_chunk: usize,
    worker: &Worker<'_>,
    undo: Option<&Undo<'_>>,
) -> Result<(), SptError> {
    let chunks = split(n, min_chunk);
    if chunks.is_empty() {
        return Ok(());
    }

    // 每块推进到的位置，初始为块起点（表示未推进）
    let reached: Vec<AtomicUsize> = chunks.iter().map(|r| AtomicUsize::new(r.start)).collect();
    let abort = AtomicBool::new(false);
    let first_err: Mutex<Option<SptError>> = Mutex::new(None);

    let job = |i: usize| {
        if abort.load(Ordering::Acquire) {
            return;
        }
        let range = &chunks[i];
        let (result, next) = worker(range.start, range.end);
        let next = next.clamp(range.start, range.end);
        reached[i].store(next, Ordering::Release);

        if let Err(err) = result {
            abort.store(true, Ordering::Release);
            let mut slot = first_err.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    };

    dispatcher.dispatch(chunks.len(), &job);

    let err = match first_err.lock().take() {
        None => return Ok(()),
        Some(err) => err,
    };

    if let Some(undo) = undo {
        for (range, next) in chunks.iter().zip(reached.iter()) {
            let next = next.load(Ordering::Acquire);
            if next > range.start {
                undo(range.start, next);
            }
        }
    }

    log::debug!("vmtask: job of {} units failed: {:?}", n, err);
    Err(err)
}
