use super::delegate::Delegate;
use super::thread::{AvThread, ThreadPriority};
use crate::core::{log_ctx, DispatchError};
use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

/// 通用工作线程池
///
/// 选择线程时优先选空闲的（排队最少的那个），都在忙就选当前任务开始得最晚的。
pub struct Workqueue {
    threads: Vec<AvThread>,
}

impl Workqueue {
    pub fn new(size: usize) -> Result<Self, DispatchError> {
        let size = size.max(1);
        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            threads.push(AvThread::spawn(&format!("workqueue-{}", i), ThreadPriority::Normal)?);
        }
        info!("{} 🧰 工作线程池已启动 ({} 个线程)", log_ctx(), size);
        Ok(Self { threads })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    fn pick(&self) -> &AvThread {
        let idle = self
            .threads
            .iter()
            .filter(|t| t.stats().is_idle())
            .min_by_key(|t| t.queue().len());
        match idle {
            Some(t) => t,
            None => self
                .threads
                .iter()
                .min_by_key(|t| t.stats().busy_for())
                .unwrap_or(&self.threads[0]),
        }
    }

    /// 在池中某个线程上执行 `f`
    pub fn delegate<F, R>(&self, f: F) -> Result<Arc<Delegate<(), R>>, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let thread = self.pick();
        debug!("{} 委托交给 {}", log_ctx(), thread.name());
        thread.delegate(f)
    }

    /// 已执行的委托总数
    pub fn jobs(&self) -> u64 {
        self.threads.iter().map(|t| t.stats().jobs).sum()
    }
}

static WORKQUEUE: Lazy<Mutex<Option<Arc<Workqueue>>>> = Lazy::new(|| Mutex::new(None));

/// 创建全局工作线程池
pub fn init(size: usize) -> Result<(), DispatchError> {
    let mut global = WORKQUEUE.lock();
    if global.is_some() {
        return Err(DispatchError::AlreadyInitialized);
    }
    *global = Some(Arc::new(Workqueue::new(size)?));
    Ok(())
}

/// 全局工作线程池，未创建时按运行时配置创建
pub fn global() -> Result<Arc<Workqueue>, DispatchError> {
    let mut global = WORKQUEUE.lock();
    if let Some(wq) = global.as_ref() {
        return Ok(wq.clone());
    }
    let wq = Arc::new(Workqueue::new(super::runtime().workqueue_threads)?);
    *global = Some(wq.clone());
    Ok(wq)
}

/// 在全局工作线程池上执行 `f`
pub fn delegate<F, R>(f: F) -> Result<Arc<Delegate<(), R>>, DispatchError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    global()?.delegate(f)
}

/// 释放全局工作线程池；线程在最后一个使用者释放后退出
pub fn shutdown() {
    let wq = WORKQUEUE.lock().take();
    drop(wq);
}
