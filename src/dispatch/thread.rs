use super::delegate::{send_delegate, Delegate, DelegateCall, DelegateFlags};
use super::message::{Dispatch, Message, MessageType};
use super::registry::ActorRef;
use super::DispatchQueue;
use crate::core::{log_ctx, DispatchError};
use crossbeam_channel::bounded;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    Normal,
    /// 解码 / 输出线程使用
    High,
}

/// 线程忙闲统计
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadStats {
    pub last_start: Option<Instant>,
    pub last_stop: Option<Instant>,
    pub jobs: u64,
}

impl ThreadStats {
    /// 当前没有在执行委托
    pub fn is_idle(&self) -> bool {
        match (self.last_start, self.last_stop) {
            (None, _) => true,
            (Some(start), Some(stop)) => stop >= start,
            (Some(_), None) => false,
        }
    }

    /// 当前任务已经执行了多久
    pub fn busy_for(&self) -> Duration {
        match self.last_start {
            Some(start) if !self.is_idle() => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn begin(&mut self) {
        self.last_start = Some(Instant::now());
    }

    fn end(&mut self) {
        self.last_stop = Some(Instant::now());
        self.jobs += 1;
    }

    /// 消息里的委托已经执行过，不计数
    fn abort(&mut self) {
        self.last_stop = Some(Instant::now());
    }
}

type Startup = Result<(ActorRef, Arc<DispatchQueue>), DispatchError>;

/// 运行消息循环的线程
///
/// 线程拥有一个派发队列和一个对象；对象处理 DELEGATE（执行委托）和 QUIT（退出循环）。
/// drop 时发送 QUIT 并 join。
pub struct AvThread {
    name: String,
    actor: ActorRef,
    queue: Arc<DispatchQueue>,
    stats: Arc<Mutex<ThreadStats>>,
    handle: Option<JoinHandle<()>>,
}

impl AvThread {
    pub fn spawn(name: &str, priority: ThreadPriority) -> Result<Self, DispatchError> {
        let (ready_tx, ready_rx) = bounded::<Startup>(1);
        let stats = Arc::new(Mutex::new(ThreadStats::default()));

        let thread_stats = stats.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if priority == ThreadPriority::High {
                    raise_priority(&thread_name);
                }
                let queue = match super::init() {
                    Ok(queue) => queue,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let handler_stats = thread_stats.clone();
                let actor = ActorRef::new(&thread_name, move |_this: ActorRef, msg: &Message| {
                    thread_handler(&handler_stats, msg)
                });
                let actor = match actor {
                    Ok(actor) => actor,
                    Err(e) => {
                        super::shutdown();
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((actor, queue)));
                run_loop(&thread_name, actor);
            })
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok((actor, queue))) => Ok(Self {
                name: name.to_string(),
                actor,
                queue,
                stats,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DispatchError::Spawn(format!("线程 {} 启动时退出", name)))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 线程自己的对象
    pub fn actor(&self) -> ActorRef {
        self.actor
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn stats(&self) -> ThreadStats {
        *self.stats.lock()
    }

    /// 当前是否运行在这个线程上
    pub fn is_current(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    /// 在线程上异步执行 `f`，返回的委托可用于等待结果
    pub fn delegate<F, R>(&self, f: F) -> Result<Arc<Delegate<(), R>>, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut f = Some(f);
        let delegate = Delegate::new(
            move |_: ()| match f.take() {
                Some(f) => f(),
                None => unreachable!("一次性委托被执行两次"),
            },
            (),
            DelegateFlags::empty(),
        );
        self.delegate_call(&delegate)?;
        Ok(delegate)
    }

    /// 把已有的委托（例如可回收委托）发到线程上执行
    pub fn delegate_call<A: Send + 'static, R: Send + 'static>(
        &self,
        delegate: &Arc<Delegate<A, R>>,
    ) -> Result<(), DispatchError> {
        send_delegate(self.actor, delegate)
    }

    /// 同步调用：在线程上执行 `f` 并等待结果
    pub fn call<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(!self.is_current(), "线程 {} 同步调用自己会死锁", self.name);
        self.delegate(f)?.wait()
    }

    /// 发送 QUIT 并等待线程退出
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = self.actor.send(MessageType::Quit, None) {
            debug!("{} 线程 {} QUIT 发送失败: {}", log_ctx(), self.name, e);
        }
        if handle.thread().id() == thread::current().id() {
            warn!("⚠️ {} 线程 {} 在自身上被释放，不 join", log_ctx(), self.name);
            return;
        }
        if handle.join().is_err() {
            warn!("⚠️ {} 线程 {} panic 退出", log_ctx(), self.name);
        }
    }
}

impl Drop for AvThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn thread_handler(stats: &Mutex<ThreadStats>, msg: &Message) -> Dispatch {
    match msg.kind() {
        MessageType::Delegate => {
            stats.lock().begin();
            // 统计要在等待方被唤醒之前更新
            let ran = DelegateCall::run_message_with(msg, &mut || stats.lock().end());
            if !ran {
                stats.lock().abort();
            }
            Dispatch::Ok
        }
        MessageType::Quit | MessageType::Destroy | MessageType::Cleanup => Dispatch::Ok,
        other => {
            trace!("{} 线程对象忽略消息 {:?}", log_ctx(), other);
            Dispatch::Continue
        }
    }
}

fn run_loop(name: &str, actor: ActorRef) {
    info!("{} 🧵 线程 {} 启动", log_ctx(), name);
    loop {
        match super::get_message() {
            Ok(msg) => {
                let quit = msg.kind() == MessageType::Quit;
                super::dispatch_message(msg);
                if quit {
                    break;
                }
            }
            Err(DispatchError::WouldBlock) => continue,
            Err(_) => break,
        }
    }

    // 在自己的队列上走完对象的销毁流程
    if let Ok(handle) = actor.destroy() {
        while !handle.is_done() {
            match super::get_message() {
                Ok(msg) => super::dispatch_message(msg),
                Err(DispatchError::WouldBlock) => continue,
                Err(_) => break,
            }
        }
    }
    super::shutdown();
    info!("{} 🛑 线程 {} 退出", log_ctx(), name);
}

#[cfg(target_os = "linux")]
fn raise_priority(name: &str) {
    // SAFETY: 只查询 / 修改当前线程的调度优先级
    let ret = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, -10)
    };
    if ret != 0 {
        warn!(
            "⚠️ {} 线程 {} 无法提高优先级: {}",
            log_ctx(),
            name,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_priority(name: &str) {
    debug!("{} 当前平台不支持调整线程 {} 的优先级", log_ctx(), name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_call_runs_on_thread() {
        let t = AvThread::spawn("test-call", ThreadPriority::Normal).unwrap();
        let caller = thread::current().id();
        let (same, name) = t
            .call(move || (thread::current().id() == caller, thread::current().name().map(String::from)))
            .unwrap();
        assert!(!same);
        assert_eq!(name.as_deref(), Some("test-call"));
        assert_eq!(t.stats().jobs, 1);
        assert!(t.stats().is_idle());
    }

    #[test]
    fn test_stats_updated_before_result() {
        let t = AvThread::spawn("test-stats", ThreadPriority::Normal).unwrap();
        for i in 1..=50u64 {
            t.call(|| ()).unwrap();
            let stats = t.stats();
            assert_eq!(stats.jobs, i);
            assert!(stats.is_idle());
        }
    }

    #[test]
    fn test_delegates_run_in_order() {
        let t = AvThread::spawn("test-order", ThreadPriority::Normal).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pending: Vec<_> = (0..20)
            .map(|i| {
                let log = log.clone();
                t.delegate(move || log.lock().push(i)).unwrap()
            })
            .collect();
        for d in pending {
            d.wait().unwrap();
        }
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_join_cancels_nothing_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        let t = AvThread::spawn("test-join", ThreadPriority::High).unwrap();
        let actor = t.actor();
        let c = counter.clone();
        let d = t.delegate(move || c.fetch_add(1, Ordering::SeqCst)).unwrap();
        t.join();
        assert_eq!(d.wait().unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!actor.is_alive());
    }

    #[test]
    fn test_delegate_after_exit_fails() {
        let t = AvThread::spawn("test-exit", ThreadPriority::Normal).unwrap();
        let actor = t.actor();
        t.join();
        let d = Delegate::new(|_: ()| 1, (), DelegateFlags::empty());
        assert_eq!(send_delegate(actor, &d).unwrap_err(), DispatchError::Destroyed);
    }
}
