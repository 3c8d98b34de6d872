//! 处理线程池
//!
//! 固定数量的 OS 线程消费一个有界 crossbeam 队列，执行应用回调。
//! 与接受循环所在的 tokio 运行时完全独立：回调阻塞不会影响新连接的接受。

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::error::{RatError, RatResult};
use crate::server::lock_unpoisoned;
use crate::utils::logger::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// 当前线程所属的 (线程池编号, 工作线程序号)
    static CURRENT_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// 提交失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// 队列已满
    Full,
    /// 线程池已关闭
    Closed,
}

#[derive(Debug, Default)]
struct Monitoring {
    /// 排队中 + 执行中的任务数
    pending: AtomicUsize,
    active: AtomicUsize,
    panicked: AtomicUsize,
}

pub struct WorkerPool {
    id: u64,
    name: String,
    sender: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<(usize, JoinHandle<()>)>>,
    exit_rx: Receiver<usize>,
    monitoring: Arc<Monitoring>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, num_workers: usize, queue_capacity: usize) -> RatResult<Self> {
        if num_workers == 0 || queue_capacity == 0 {
            return Err(RatError::InvalidArgument("线程数和队列容量必须大于 0".to_string()));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (sender, receiver) = channel::bounded::<Task>(queue_capacity);
        let (exit_tx, exit_rx) = channel::unbounded();
        let monitoring = Arc::new(Monitoring::default());

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let receiver = receiver.clone();
            let exit_tx = exit_tx.clone();
            let monitoring = monitoring.clone();
            let thread_name = format!("{}-{}", name, index);
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    CURRENT_WORKER.with(|current| current.set(Some((id, index))));
                    worker_loop(&thread_name, receiver, monitoring);
                    let _ = exit_tx.send(index);
                })?;
            workers.push((index, handle));
        }

        debug!("🧵 [线程池 {}] 已启动 {} 个工作线程，队列容量 {}", name, num_workers, queue_capacity);

        Ok(Self {
            id,
            name,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            exit_rx,
            monitoring,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前线程若是本线程池的工作线程，返回其序号
    fn current_worker_index(&self) -> Option<usize> {
        CURRENT_WORKER
            .with(Cell::get)
            .and_then(|(pool_id, index)| (pool_id == self.id).then_some(index))
    }

    /// 当前线程是否是本线程池的工作线程（即正在某个任务内部）
    pub fn is_current_worker(&self) -> bool {
        self.current_worker_index().is_some()
    }

    /// 排队中 + 执行中的任务数
    pub fn pending_count(&self) -> usize {
        self.monitoring.pending.load(Ordering::SeqCst)
    }

    /// 正在执行的任务数
    pub fn active_count(&self) -> usize {
        self.monitoring.active.load(Ordering::SeqCst)
    }

    pub fn panicked_count(&self) -> usize {
        self.monitoring.panicked.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().map(|sender| sender.is_none()).unwrap_or(true)
    }

    /// 非阻塞提交任务
    pub fn try_execute<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.read().map_err(|_| SubmitError::Closed)?;
        let Some(sender) = guard.as_ref() else {
            return Err(SubmitError::Closed);
        };

        self.monitoring.pending.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.monitoring.pending.fetch_sub(1, Ordering::SeqCst);
                match e {
                    TrySendError::Full(_) => Err(SubmitError::Full),
                    TrySendError::Disconnected(_) => Err(SubmitError::Closed),
                }
            }
        }
    }

    /// 停止接收新任务，等待已排队和执行中的任务在宽限期内完成
    ///
    /// 返回超过宽限期仍未结束、被放弃的工作线程数。被放弃的线程会被分离，
    /// 它们持有的会话由调用方负责回收。
    ///
    /// 在本线程池的任务内部调用时不等待当前工作线程，它在任务返回后自行退出。
    pub fn shutdown(&self, grace: Duration) -> usize {
        // 丢弃发送端：工作线程处理完队列剩余任务后自然退出
        match self.sender.write() {
            Ok(mut sender) => drop(sender.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }

        let mut workers = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        if let Some(current) = self.current_worker_index() {
            workers.retain(|(index, _)| *index != current);
        }
        if workers.is_empty() {
            return 0;
        }

        let deadline = Instant::now() + grace;
        let mut exited = Vec::with_capacity(workers.len());
        while exited.len() < workers.len() {
            match self.exit_rx.recv_deadline(deadline) {
                Ok(index) => exited.push(index),
                Err(_) => break,
            }
        }

        let mut abandoned = 0;
        for (index, handle) in workers {
            if exited.contains(&index) {
                let _ = handle.join();
            } else {
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            warn!(
                "⏰ [线程池 {}] {} 个工作线程超过宽限期 {:?} 仍未结束，已放弃（剩余任务 {} 个）",
                self.name,
                abandoned,
                grace,
                self.pending_count()
            );
        } else {
            debug!("🧵 [线程池 {}] 所有工作线程已退出", self.name);
        }
        abandoned
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
    }
}

fn worker_loop(thread_name: &str, receiver: Receiver<Task>, monitoring: Arc<Monitoring>) {
    while let Ok(task) = receiver.recv() {
        monitoring.active.fetch_add(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            monitoring.panicked.fetch_add(1, Ordering::SeqCst);
            error!("💥 [{}] 处理任务发生 panic，工作线程继续运行", thread_name);
        }
        monitoring.active.fetch_sub(1, Ordering::SeqCst);
        monitoring.pending.fetch_sub(1, Ordering::SeqCst);
    }
}
