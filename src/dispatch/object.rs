//! 派发对象（actor）
//!
//! 对象绑定在某个线程的派发队列上，只在该线程上执行处理器。
//! 销毁分两步：
//!
//! 1. `destroy()` 向对象自己的队列发送 DESTROY。处理器返回 `Dispatch::Ok`
//!    表示同意，随即排入 CLEANUP；返回 `Dispatch::Continue` 则由定时器在
//!    一小段时间后重发 DESTROY（次数有上限）。
//! 2. CLEANUP 最后一次调用处理器，然后把对象从对象表中移除。
//!    CLEANUP 开始之后不再投递任何其他消息。
//!
//! 用户上下文（处理器本身）在最后一个强引用释放时析构。

use super::message::{Destination, Dispatch, Handler, Message, MessageType, Payload};
use super::registry::{self, ActorRef};
use super::{timers, DispatchQueue};
use crate::core::{log_ctx, DispatchError};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Phase {
    Live = 0,
    Destroying = 1,
    Cleanup = 2,
    Freed = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Live,
            1 => Phase::Destroying,
            2 => Phase::Cleanup,
            _ => Phase::Freed,
        }
    }
}

/// 一次性完成信号
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self { done: Mutex::new(false), cond: Condvar::new() }
    }

    fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

pub(crate) struct ActorCell {
    id: ActorRef,
    name: String,
    queue: Arc<DispatchQueue>,
    handler: Mutex<Box<dyn Handler>>,
    phase: AtomicU8,
    destroy_attempts: AtomicU32,
    done: Arc<Completion>,
}

impl ActorCell {
    fn new(id: ActorRef, name: &str, queue: Arc<DispatchQueue>, handler: Box<dyn Handler>) -> Self {
        Self {
            id,
            name: name.to_string(),
            queue,
            handler: Mutex::new(handler),
            phase: AtomicU8::new(Phase::Live as u8),
            destroy_attempts: AtomicU32::new(0),
            done: Arc::new(Completion::new()),
        }
    }

    pub(crate) fn id(&self) -> ActorRef {
        self.id
    }

    pub(crate) fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// 还能接收普通消息（CLEANUP 尚未开始）
    pub(crate) fn accepts_messages(&self) -> bool {
        self.phase() < Phase::Cleanup
    }

    fn call(&self, msg: &Message) -> Dispatch {
        self.handler.lock().handle(self.id, msg)
    }

    fn lifecycle_message(self: &Arc<Self>, kind: MessageType) -> Message {
        Message::new(kind, super::CastMode::Unicast, None, Destination::One(self.clone()))
    }

    /// 在所属线程上投递一条消息
    pub(crate) fn deliver(self: &Arc<Self>, msg: &Message) -> Dispatch {
        let phase = self.phase();
        match msg.kind() {
            MessageType::Cleanup => {
                assert_eq!(phase, Phase::Cleanup, "{} 收到了多余的 CLEANUP", self.name);
                self.call(msg);
                self.finish();
                Dispatch::Ok
            }
            _ if phase >= Phase::Cleanup => {
                trace!("{} 对象 {} 已在清理，丢弃 {:?}", log_ctx(), self.name, msg.kind());
                Dispatch::Continue
            }
            MessageType::Destroy => self.on_destroy(msg),
            _ => self.call(msg),
        }
    }

    fn on_destroy(self: &Arc<Self>, msg: &Message) -> Dispatch {
        let config = super::runtime();
        let attempts = self.destroy_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let res = self.call(msg);

        if res == Dispatch::Continue && attempts <= config.destroy_max_retries {
            trace!("{} 对象 {} 暂不能销毁，{}ms 后重试", log_ctx(), self.name, config.destroy_retry_ms);
            let id = self.id;
            let retry = timers::once(config.destroy_retry(), move || {
                if let Err(e) = id.send(MessageType::Destroy, None) {
                    debug!("重发 DESTROY 失败: {:?} {}", id, e);
                }
            });
            match retry {
                Ok(_) => return Dispatch::Continue,
                Err(e) => error!("{} 无法安排 DESTROY 重试: {}，直接清理 {}", log_ctx(), e, self.name),
            }
        } else if res == Dispatch::Continue {
            warn!("⚠️ {} 对象 {} 拒绝销毁 {} 次，强制清理", log_ctx(), self.name, attempts);
        }

        self.set_phase(Phase::Cleanup);
        let cleanup = self.lifecycle_message(MessageType::Cleanup);
        if let Err(e) = self.queue.mailbox().put(cleanup) {
            // 队列已关闭：就地完成清理
            let cleanup = e.into_inner();
            self.deliver(&cleanup);
        }
        Dispatch::Ok
    }

    fn finish(&self) {
        self.set_phase(Phase::Freed);
        self.queue.unbind(self.id);
        let removed = registry::remove(self.id);
        debug!("{} 🧹 对象 {} 已清理", log_ctx(), self.name);
        self.done.complete();
        drop(removed);
    }

    /// 所属线程已退出时在当前线程上直接走完销毁流程
    pub(crate) fn force_cleanup(self: &Arc<Self>) {
        match self.phase() {
            Phase::Freed => {}
            Phase::Cleanup => {
                let cleanup = self.lifecycle_message(MessageType::Cleanup);
                self.deliver(&cleanup);
            }
            Phase::Live | Phase::Destroying => {
                warn!("⚠️ {} 队列 {} 已关闭，强制销毁对象 {}", log_ctx(), self.queue.name(), self.name);
                let destroy = self.lifecycle_message(MessageType::Destroy);
                self.call(&destroy);
                self.set_phase(Phase::Cleanup);
                let cleanup = self.lifecycle_message(MessageType::Cleanup);
                self.deliver(&cleanup);
            }
        }
    }
}

/// 显式引用：持有期间对象的内存不会被释放
pub struct ActorGuard {
    cell: Arc<ActorCell>,
}

impl ActorGuard {
    pub fn id(&self) -> ActorRef {
        self.cell.id
    }

    /// 对象是否还能接收消息
    pub fn is_alive(&self) -> bool {
        self.cell.accepts_messages()
    }
}

impl fmt::Debug for ActorGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorGuard").field("actor", &self.cell.id).field("name", &self.cell.name).finish()
    }
}

impl Clone for ActorGuard {
    fn clone(&self) -> Self {
        Self { cell: self.cell.clone() }
    }
}

/// 销毁完成句柄：CLEANUP 执行完毕后完成
#[derive(Clone)]
pub struct DestroyHandle {
    actor: ActorRef,
    done: Arc<Completion>,
}

impl DestroyHandle {
    pub fn actor(&self) -> ActorRef {
        self.actor
    }

    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }

    /// 等待清理完成，超时返回 false
    pub fn wait(&self, timeout: Duration) -> bool {
        self.done.wait(timeout)
    }
}

impl ActorRef {
    /// 在当前线程的派发队列上创建对象
    pub fn new<H: Handler>(name: &str, handler: H) -> Result<ActorRef, DispatchError> {
        let queue = super::current_queue().ok_or(DispatchError::NoQueue)?;
        Self::new_on(&queue, name, handler)
    }

    /// 在指定的派发队列上创建对象
    pub fn new_on<H: Handler>(queue: &Arc<DispatchQueue>, name: &str, handler: H) -> Result<ActorRef, DispatchError> {
        if queue.is_closed() {
            return Err(DispatchError::Shutdown);
        }
        let (id, _cell) = registry::insert_with(|id| {
            Arc::new(ActorCell::new(id, name, queue.clone(), Box::new(handler)))
        })?;
        queue.bind(id);
        debug!("{} 创建对象 {} {:?} (队列 {})", log_ctx(), name, id, queue.name());
        Ok(id)
    }

    /// 对象是否存在且尚未开始清理
    pub fn is_alive(&self) -> bool {
        registry::resolve(*self).map(|c| c.accepts_messages()).unwrap_or(false)
    }

    pub fn name(&self) -> Option<String> {
        registry::resolve(*self).map(|c| c.name.clone())
    }

    /// 对象所在的派发队列
    pub fn queue(&self) -> Option<Arc<DispatchQueue>> {
        registry::resolve(*self).map(|c| c.queue.clone())
    }

    /// 增加一个引用
    pub fn acquire(&self) -> Result<ActorGuard, DispatchError> {
        let cell = registry::resolve(*self).ok_or(DispatchError::Destroyed)?;
        Ok(ActorGuard { cell })
    }

    /// 单播一条消息
    pub fn send(&self, kind: MessageType, payload: Option<Payload>) -> Result<(), DispatchError> {
        super::send(std::slice::from_ref(self), kind, super::CastMode::Unicast, payload)
    }

    /// 单播一条带类型负载的消息
    pub fn post<T: Any + Send + Sync>(&self, kind: MessageType, value: T) -> Result<(), DispatchError> {
        self.send(kind, Some(Arc::new(value)))
    }

    /// 发起销毁；重复调用返回同一个完成句柄
    pub fn destroy(&self) -> Result<DestroyHandle, DispatchError> {
        let cell = registry::resolve(*self).ok_or(DispatchError::Destroyed)?;
        let handle = DestroyHandle { actor: *self, done: cell.done.clone() };

        let started = cell
            .phase
            .compare_exchange(Phase::Live as u8, Phase::Destroying as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !started {
            return Ok(handle);
        }

        debug!("{} 销毁对象 {} {:?}", log_ctx(), cell.name, self);
        let destroy = cell.lifecycle_message(MessageType::Destroy);
        if let Err(e) = cell.queue.mailbox().put(destroy) {
            debug!("{} 队列已关闭 ({})，就地销毁 {}", log_ctx(), e, cell.name);
            cell.force_cleanup();
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{self, CastMode};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Counting {
        cleanups: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
        refuse: u32,
    }

    impl Handler for Counting {
        fn handle(&mut self, _this: ActorRef, msg: &Message) -> Dispatch {
            match msg.kind() {
                MessageType::Destroy if self.refuse > 0 => {
                    self.refuse -= 1;
                    Dispatch::Continue
                }
                MessageType::Cleanup => {
                    self.cleanups.fetch_add(1, Ordering::SeqCst);
                    Dispatch::Ok
                }
                _ => Dispatch::Ok,
            }
        }
    }

    impl Drop for Counting {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pump_until(handle: &DestroyHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_done() && Instant::now() < deadline {
            if let Ok(msg) = dispatch::timed_get_message(Duration::from_millis(10)) {
                dispatch::dispatch_message(msg);
            }
        }
    }

    #[test]
    fn test_refcount_cleanup_runs_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        dispatch::init().unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let actor = ActorRef::new(
            "counting",
            Counting { cleanups: cleanups.clone(), drops: drops.clone(), refuse: 0 },
        )
        .unwrap();

        let guards: Vec<ActorGuard> = (0..8)
            .map(|_| {
                thread::spawn(move || actor.acquire().unwrap())
            })
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards[0].id(), actor);
        assert!(format!("{:?}", guards[0]).starts_with("ActorGuard"));

        let handle = actor.destroy().unwrap();
        // 重复销毁不会开始第二轮
        let again = actor.destroy().unwrap();
        pump_until(&handle);
        assert!(again.is_done());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!actor.is_alive());
        assert_eq!(actor.acquire().unwrap_err(), DispatchError::Destroyed);

        // 引用还在，内存不释放
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        let unrefs: Vec<_> = guards.into_iter().map(|g| thread::spawn(move || drop(g))).collect();
        for h in unrefs {
            h.join().unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        dispatch::shutdown();
    }

    #[test]
    fn test_destroy_retries_until_accepted() {
        dispatch::init().unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let actor = ActorRef::new(
            "reluctant",
            Counting { cleanups: cleanups.clone(), drops: drops.clone(), refuse: 2 },
        )
        .unwrap();

        let handle = actor.destroy().unwrap();
        pump_until(&handle);
        assert!(handle.is_done());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        dispatch::shutdown();
    }

    #[test]
    fn test_no_delivery_after_cleanup() {
        dispatch::init().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let actor = {
            let seen = seen.clone();
            ActorRef::new("late", move |_this: ActorRef, msg: &Message| {
                if msg.kind() == MessageType::User(1) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Dispatch::Ok
            })
            .unwrap()
        };
        actor.post(MessageType::User(1), ()).unwrap();
        let handle = actor.destroy().unwrap();
        pump_until(&handle);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            dispatch::send(&[actor], MessageType::User(1), CastMode::Unicast, None).unwrap_err(),
            DispatchError::Destroyed
        );
        dispatch::shutdown();
    }

    #[test]
    fn test_actor_without_queue() {
        let err = thread::spawn(|| ActorRef::new("orphan", |_: ActorRef, _: &Message| Dispatch::Ok))
            .join()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, DispatchError::NoQueue);
    }
}
