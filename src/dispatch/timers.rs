//! 定时器服务
//!
//! 一个后台线程维护按到期时间排序的堆。定时器到期后要么给对象发 TIMER 消息
//! （负载为 [`TimerData`]），要么在定时器线程上直接运行回调。回调必须很快返回。
//!
//! `cancel()` 之后不会再触发，但已经排进对象队列的 TIMER 消息仍会送达，
//! 处理器应核对 `TimerData::id`。

use super::message::{MessageType, Payload};
use super::registry::ActorRef;
use crate::core::{log_ctx, DispatchError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace};
use once_cell::sync::Lazy;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    AutoReload,
}

/// TIMER 消息的负载
pub struct TimerData {
    pub id: TimerId,
    pub data: Option<Payload>,
}

enum Action {
    Message { target: ActorRef, data: Option<Payload> },
    Callback(Box<dyn FnMut(TimerId) -> bool + Send>),
}

struct Entry {
    interval: Duration,
    kind: TimerKind,
    action: Action,
}

enum Command {
    Add { id: TimerId, deadline: Instant, entry: Entry },
    Cancel(TimerId),
}

struct TimerService {
    tx: Sender<Command>,
    next_id: AtomicU64,
}

static SERVICE: Lazy<TimerService> = Lazy::new(TimerService::start);

impl TimerService {
    fn start() -> Self {
        let (tx, rx) = unbounded();
        let spawned = thread::Builder::new()
            .name("timers".to_string())
            .spawn(move || timer_loop(rx));
        if let Err(e) = spawned {
            error!("{} ❌ 定时器线程启动失败: {}", log_ctx(), e);
        }
        Self { tx, next_id: AtomicU64::new(1) }
    }

    fn add(&self, interval: Duration, kind: TimerKind, action: Action) -> Result<TimerId, DispatchError> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let interval = interval.max(MIN_INTERVAL);
        let entry = Entry { interval, kind, action };
        self.tx
            .send(Command::Add { id, deadline: Instant::now() + interval, entry })
            .map_err(|_| DispatchError::Shutdown)?;
        Ok(id)
    }
}

fn fire(id: TimerId, entry: &mut Entry) -> bool {
    match &mut entry.action {
        Action::Message { target, data } => {
            let payload = TimerData { id, data: data.clone() };
            match target.post(MessageType::Timer, payload) {
                Ok(()) => true,
                Err(e) => {
                    debug!("{} 定时器 {:?} 的目标不可用 ({})，移除", log_ctx(), id, e);
                    false
                }
            }
        }
        Action::Callback(f) => f(id),
    }
}

fn timer_loop(rx: Receiver<Command>) {
    let mut heap: BinaryHeap<Reverse<(Instant, TimerId)>> = BinaryHeap::new();
    let mut entries: HashMap<TimerId, Entry> = HashMap::new();

    loop {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = heap.peek().copied() {
            if deadline > now {
                break;
            }
            heap.pop();
            let Some(mut entry) = entries.remove(&id) else {
                continue;
            };
            trace!("{} ⏰ 定时器 {:?} 到期", log_ctx(), id);
            let keep = fire(id, &mut entry);
            if keep && entry.kind == TimerKind::AutoReload {
                let next = (deadline + entry.interval).max(now);
                heap.push(Reverse((next, id)));
                entries.insert(id, entry);
            }
        }

        let cmd = match heap.peek() {
            Some(Reverse((deadline, _))) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };

        match cmd {
            Command::Add { id, deadline, entry } => {
                heap.push(Reverse((deadline, id)));
                entries.insert(id, entry);
            }
            Command::Cancel(id) => {
                entries.remove(&id);
            }
        }
    }
}

/// 到期后给 `target` 发 TIMER 消息
pub fn register(
    interval: Duration,
    kind: TimerKind,
    target: ActorRef,
    data: Option<Payload>,
) -> Result<TimerId, DispatchError> {
    SERVICE.add(interval, kind, Action::Message { target, data })
}

/// 到期后在定时器线程上运行回调；回调返回 false 时停止自动重载
pub fn register_callback<F>(interval: Duration, kind: TimerKind, callback: F) -> Result<TimerId, DispatchError>
where
    F: FnMut(TimerId) -> bool + Send + 'static,
{
    SERVICE.add(interval, kind, Action::Callback(Box::new(callback)))
}

/// 一次性回调
pub fn once<F>(delay: Duration, f: F) -> Result<TimerId, DispatchError>
where
    F: FnOnce() + Send + 'static,
{
    let mut f = Some(f);
    register_callback(delay, TimerKind::OneShot, move |_| {
        if let Some(f) = f.take() {
            f();
        }
        false
    })
}

pub fn cancel(id: TimerId) {
    let _ = SERVICE.tx.send(Command::Cancel(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{self, Dispatch, Message};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_oneshot_callback() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        once(Duration::from_millis(5), move || {
            let _ = tx.send(Instant::now());
        })
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_autoreload_until_cancelled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = register_callback(Duration::from_millis(2), TimerKind::AutoReload, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(hits.load(Ordering::SeqCst) >= 3);
        cancel(id);
        thread::sleep(Duration::from_millis(20));
        let after = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_timer_message_to_actor() {
        dispatch::init().unwrap();
        let got = Arc::new(Mutex::new(None));
        let actor = {
            let got = got.clone();
            ActorRef::new("timer-target", move |_: ActorRef, msg: &Message| {
                if let Some(t) = msg.payload::<TimerData>() {
                    let data = t.data.as_ref().and_then(|d| d.downcast_ref::<u32>()).copied();
                    *got.lock() = Some((t.id, data));
                }
                Dispatch::Ok
            })
            .unwrap()
        };
        let id = register(Duration::from_millis(5), TimerKind::OneShot, actor, Some(Arc::new(9u32))).unwrap();
        let msg = dispatch::timed_get_message(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.kind(), MessageType::Timer);
        dispatch::dispatch_message(msg);
        assert_eq!(*got.lock(), Some((id, Some(9))));
        dispatch::shutdown();
    }
}
