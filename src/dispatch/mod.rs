//! 消息派发运行时
//!
//! 每个参与派发的线程先调用 [`init`] 创建自己的派发队列，之后在这个线程上
//! 创建的对象都绑定到该队列，处理器只会在该线程上运行。

pub mod queue;
pub mod message;
pub mod registry;
pub mod object;
pub mod delegate;
pub mod checkpoint;
pub mod thread;
pub mod workqueue;
pub mod timers;
pub mod pool;

pub use checkpoint::Checkpoint;
pub use delegate::{Delegate, DelegateFlags};
pub use message::{CastMode, Dispatch, Handler, Message, MessageType, Payload};
pub use object::{ActorGuard, DestroyHandle};
pub use pool::Pool;
pub use queue::Mailbox;
pub use registry::ActorRef;
pub use thread::{AvThread, ThreadPriority};
pub use timers::{TimerData, TimerId, TimerKind};
pub use workqueue::Workqueue;

use crate::core::{log_ctx, DispatchError, QueueError, RuntimeConfig};
use log::{debug, info, warn};
use message::Destination;
use object::ActorCell;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

/// 线程的派发队列
pub struct DispatchQueue {
    id: u64,
    name: String,
    mailbox: Mailbox<Message>,
    actors: Mutex<Vec<ActorRef>>,
}

impl DispatchQueue {
    fn new(name: String) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            mailbox: Mailbox::with_put_wait(0, runtime().put_wait()),
            actors: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 排队中的消息数
    pub fn len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// 唤醒阻塞在 `get_message` 上的线程
    pub fn wake(&self) {
        self.mailbox.wake();
    }

    pub(crate) fn mailbox(&self) -> &Mailbox<Message> {
        &self.mailbox
    }

    fn post(&self, msg: Message) -> Result<(), DispatchError> {
        self.mailbox.put(msg).map_err(|e| DispatchError::from(e.kind))
    }

    pub(crate) fn bind(&self, id: ActorRef) {
        self.actors.lock().push(id);
    }

    pub(crate) fn unbind(&self, id: ActorRef) {
        self.actors.lock().retain(|a| *a != id);
    }

    /// 绑定在该队列上的对象快照
    pub fn actors(&self) -> Vec<ActorRef> {
        self.actors.lock().clone()
    }

    /// 投递给该队列上的所有存活对象
    pub fn broadcast(&self, kind: MessageType, payload: Option<Payload>) -> Result<(), DispatchError> {
        let cells: Vec<Arc<ActorCell>> = self
            .actors()
            .into_iter()
            .filter_map(registry::resolve)
            .filter(|c| c.accepts_messages())
            .collect();
        if cells.is_empty() {
            return Ok(());
        }
        self.post(Message::new(kind, CastMode::Broadcast, payload, Destination::Many(cells)))
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

static QUEUES: Lazy<Mutex<HashMap<ThreadId, Arc<DispatchQueue>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

static RUNTIME: Lazy<RwLock<RuntimeConfig>> = Lazy::new(|| RwLock::new(RuntimeConfig::default()));

thread_local! {
    static CURRENT: RefCell<Option<Arc<DispatchQueue>>> = const { RefCell::new(None) };
}

/// 设置派发运行时参数（影响之后创建的队列和销毁重试）
pub fn configure(config: RuntimeConfig) {
    *RUNTIME.write() = config;
}

pub fn runtime() -> RuntimeConfig {
    RUNTIME.read().clone()
}

/// 为当前线程创建派发队列
pub fn init() -> Result<Arc<DispatchQueue>, DispatchError> {
    if current_queue().is_some() {
        warn!("{} 当前线程的派发队列已经创建", log_ctx());
        return Err(DispatchError::AlreadyInitialized);
    }
    let this = std::thread::current();
    let name = this.name().unwrap_or("unnamed").to_string();
    let queue = Arc::new(DispatchQueue::new(name));
    QUEUES.lock().insert(this.id(), queue.clone());
    CURRENT.with(|c| *c.borrow_mut() = Some(queue.clone()));
    debug!("{} 派发队列 #{} ({}) 已创建", log_ctx(), queue.id, queue.name);
    Ok(queue)
}

/// 销毁当前线程的派发队列
///
/// 队列被关闭，剩余消息直接丢弃（其中未执行的委托调用会被取消），
/// 仍绑定在队列上的对象被强制清理。
pub fn shutdown() {
    let queue = CURRENT.with(|c| c.borrow_mut().take());
    let Some(queue) = queue else {
        panic!("派发队列未初始化");
    };
    QUEUES.lock().remove(&std::thread::current().id());
    queue.mailbox.close();

    let leftover = queue.mailbox.drain();
    if !leftover.is_empty() {
        debug!("{} 队列 {} 关闭时丢弃 {} 条消息", log_ctx(), queue.name, leftover.len());
    }
    drop(leftover);

    for id in queue.actors() {
        if let Some(cell) = registry::resolve(id) {
            cell.force_cleanup();
        }
    }
    debug!("{} 派发队列 #{} ({}) 已销毁", log_ctx(), queue.id, queue.name);
}

/// 当前线程的派发队列
pub fn current_queue() -> Option<Arc<DispatchQueue>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// 按线程查找派发队列
pub fn queue_of(thread: ThreadId) -> Option<Arc<DispatchQueue>> {
    QUEUES.lock().get(&thread).cloned()
}

fn with_current<R>(f: impl FnOnce(&DispatchQueue) -> Result<R, QueueError>) -> Result<R, DispatchError> {
    let queue = current_queue().ok_or(DispatchError::NoQueue)?;
    f(&queue).map_err(DispatchError::from)
}

/// 阻塞取出当前线程的下一条消息
pub fn get_message() -> Result<Message, DispatchError> {
    with_current(|q| q.mailbox.get())
}

pub fn timed_get_message(timeout: Duration) -> Result<Message, DispatchError> {
    with_current(|q| q.mailbox.timed_get(timeout))
}

/// 查看下一条消息但不取出
pub fn peek_message(block: bool) -> Result<Message, DispatchError> {
    with_current(|q| q.mailbox.peek(block))
}

/// 关闭当前线程的派发队列；`get_message` 取完剩余消息后返回 `Shutdown`
pub fn close() {
    if let Some(queue) = current_queue() {
        queue.mailbox.close();
    }
}

/// 把消息交给它的目标处理，处理完后消息被释放
pub fn dispatch_message(msg: Message) {
    #[cfg(debug_assertions)]
    if let Some(current) = current_queue() {
        for cell in msg.targets() {
            debug_assert_eq!(
                cell.queue().id(),
                current.id(),
                "队列 {} 的消息在队列 {} 上派发",
                cell.queue().name(),
                current.name()
            );
        }
    }

    match msg.cast() {
        CastMode::Anycast => {
            for cell in msg.targets() {
                if cell.deliver(&msg) == Dispatch::Ok {
                    break;
                }
            }
        }
        CastMode::Unicast | CastMode::Multicast | CastMode::Broadcast => {
            for cell in msg.targets() {
                cell.deliver(&msg);
            }
        }
    }
}

/// 派发当前已排队的全部消息，不阻塞；返回派发的条数
pub fn dispatch_pending() -> usize {
    let Some(queue) = current_queue() else {
        return 0;
    };
    let mut n = 0;
    while let Ok(msg) = queue.mailbox.try_get() {
        dispatch_message(msg);
        n += 1;
    }
    n
}

fn resolve_all(dest: &[ActorRef]) -> Result<Vec<Arc<ActorCell>>, DispatchError> {
    if dest.is_empty() {
        return Err(DispatchError::InvalidCast("目标列表为空"));
    }
    let mut cells = Vec::new();
    cells.try_reserve(dest.len()).map_err(|_| DispatchError::OutOfMemory)?;
    for id in dest {
        match registry::resolve(*id) {
            Some(cell) if cell.accepts_messages() => cells.push(cell),
            _ => debug!("{} 跳过已销毁的目标 {:?}", log_ctx(), id),
        }
    }
    if cells.is_empty() {
        return Err(DispatchError::Destroyed);
    }
    Ok(cells)
}

/// 按队列分组，保持目标的原始顺序
fn group_by_queue(cells: Vec<Arc<ActorCell>>) -> Vec<(Arc<DispatchQueue>, Vec<Arc<ActorCell>>)> {
    let mut groups: Vec<(Arc<DispatchQueue>, Vec<Arc<ActorCell>>)> = Vec::new();
    for cell in cells {
        match groups.iter_mut().find(|(q, _)| q.id() == cell.queue().id()) {
            Some((_, members)) => members.push(cell),
            None => groups.push((cell.queue().clone(), vec![cell])),
        }
    }
    groups
}

/// 发送消息
///
/// - `Unicast`：必须恰好一个目标
/// - `Anycast`：所有目标必须在同一个派发队列上
/// - `Multicast`：每个目标队列一条消息，已销毁的目标被跳过
/// - `Broadcast`：`dest` 指定目标线程，投递给这些线程上的全部对象
pub fn send(dest: &[ActorRef], kind: MessageType, cast: CastMode, payload: Option<Payload>) -> Result<(), DispatchError> {
    match cast {
        CastMode::Unicast => {
            assert_eq!(dest.len(), 1, "单播只能有一个目标");
            let cell = match registry::resolve(dest[0]) {
                Some(cell) if cell.accepts_messages() => cell,
                _ => return Err(DispatchError::Destroyed),
            };
            let queue = cell.queue().clone();
            queue.post(Message::new(kind, cast, payload, Destination::One(cell)))
        }
        CastMode::Anycast => {
            let cells = resolve_all(dest)?;
            let queue = cells[0].queue().clone();
            if cells.iter().any(|c| c.queue().id() != queue.id()) {
                return Err(DispatchError::InvalidCast("anycast 的目标必须在同一个派发队列上"));
            }
            queue.post(Message::new(kind, cast, payload, Destination::Many(cells)))
        }
        CastMode::Multicast => {
            let cells = resolve_all(dest)?;
            let mut result = Ok(());
            for (queue, members) in group_by_queue(cells) {
                let msg = Message::new(kind, cast, payload.clone(), Destination::Many(members));
                if let Err(e) = queue.post(msg) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            result
        }
        CastMode::Broadcast => {
            let cells = resolve_all(dest)?;
            let mut result = Ok(());
            for (queue, _) in group_by_queue(cells) {
                if let Err(e) = queue.broadcast(kind, payload.clone()) {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            result
        }
    }
}

/// 当前已创建的派发队列数量
pub fn queue_count() -> usize {
    QUEUES.lock().len()
}

/// 打印运行时概况
pub fn log_summary() {
    info!(
        "{} 📊 派发队列 {} 个，存活对象 {} 个",
        log_ctx(),
        queue_count(),
        registry::live_actors()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str, result: Dispatch) -> impl Handler {
        move |_this: ActorRef, msg: &Message| {
            if msg.kind() == MessageType::User(7) {
                log.lock().push(name);
            }
            result
        }
    }

    #[test]
    fn test_init_twice_fails() {
        init().unwrap();
        assert_eq!(init().err(), Some(DispatchError::AlreadyInitialized));
        shutdown();
        assert!(current_queue().is_none());
    }

    #[test]
    fn test_anycast_short_circuit() {
        init().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = ActorRef::new("a", recorder(log.clone(), "a", Dispatch::Continue)).unwrap();
        let b = ActorRef::new("b", recorder(log.clone(), "b", Dispatch::Ok)).unwrap();
        let c = ActorRef::new("c", recorder(log.clone(), "c", Dispatch::Ok)).unwrap();

        send(&[a, b, c], MessageType::User(7), CastMode::Anycast, None).unwrap();
        assert_eq!(dispatch_pending(), 1);
        assert_eq!(*log.lock(), vec!["a", "b"]);
        shutdown();
    }

    #[test]
    fn test_multicast_and_broadcast_reach_everyone() {
        init().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = ActorRef::new("a", recorder(log.clone(), "a", Dispatch::Ok)).unwrap();
        let b = ActorRef::new("b", recorder(log.clone(), "b", Dispatch::Ok)).unwrap();
        let _c = ActorRef::new("c", recorder(log.clone(), "c", Dispatch::Continue)).unwrap();

        send(&[a, b], MessageType::User(7), CastMode::Multicast, None).unwrap();
        dispatch_pending();
        assert_eq!(*log.lock(), vec!["a", "b"]);

        log.lock().clear();
        send(&[a], MessageType::User(7), CastMode::Broadcast, None).unwrap();
        dispatch_pending();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        shutdown();
    }

    #[test]
    fn test_anycast_across_queues_rejected() {
        init().unwrap();
        let local = ActorRef::new("local", |_: ActorRef, _: &Message| Dispatch::Ok).unwrap();
        let remote = AvThread::spawn("anycast-remote", ThreadPriority::Normal).unwrap();
        let err = send(&[local, remote.actor()], MessageType::User(1), CastMode::Anycast, None).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidCast(_)));
        drop(remote);
        shutdown();
    }

    #[test]
    fn test_payload_roundtrip_and_fifo() {
        init().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let actor = {
            let seen = seen.clone();
            ActorRef::new("fifo", move |_: ActorRef, msg: &Message| {
                if let Some(v) = msg.payload::<u32>() {
                    seen.lock().push(*v);
                }
                Dispatch::Ok
            })
            .unwrap()
        };
        for i in 0..50u32 {
            actor.post(MessageType::User(1), i).unwrap();
        }
        let peeked = peek_message(false).unwrap();
        assert_eq!(peeked.payload::<u32>(), Some(&0));
        drop(peeked);
        assert_eq!(dispatch_pending(), 50);
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        shutdown();
    }

    #[test]
    fn test_shutdown_forces_cleanup() {
        init().unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let actor = {
            let cleanups = cleanups.clone();
            ActorRef::new("leftover", move |_: ActorRef, msg: &Message| {
                if msg.kind() == MessageType::Cleanup {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }
                Dispatch::Ok
            })
            .unwrap()
        };
        shutdown();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!actor.is_alive());
    }
}
