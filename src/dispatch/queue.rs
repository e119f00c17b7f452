use crate::core::{PutError, QueueError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 默认的 put 等待时间
pub const DEFAULT_PUT_WAIT: Duration = Duration::from_millis(100);

/// 有界阻塞队列（邮箱）
///
/// 所有状态都在同一把锁下修改，任何状态变化都用 `notify_all` 广播唤醒，
/// 被唤醒的一方自己重新检查条件。
///
/// - `capacity == 0` 表示无界
/// - `put` 在队列满时只等待一次唤醒，仍然满就返回 `WouldBlock`
/// - 关闭后 `put` 一律失败，`get` 先取完剩余元素再返回 `Shutdown`
pub struct Mailbox<T> {
    inner: Mutex<MailboxInner<T>>,
    cond: Condvar,
    put_wait: Duration,
}

struct MailboxInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
    waiters: usize,
    /// `wake()` 每调用一次加一，阻塞中的读者看到变化后返回 `WouldBlock`
    wake_seq: u64,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_put_wait(capacity, DEFAULT_PUT_WAIT)
    }

    pub fn with_put_wait(capacity: usize, put_wait: Duration) -> Self {
        Self {
            inner: Mutex::new(MailboxInner {
                items: VecDeque::new(),
                capacity,
                closed: false,
                waiters: 0,
                wake_seq: 0,
            }),
            cond: Condvar::new(),
            put_wait,
        }
    }

    fn is_full(inner: &MailboxInner<T>) -> bool {
        inner.capacity > 0 && inner.items.len() >= inner.capacity
    }

    fn push(&self, mut inner: MutexGuard<'_, MailboxInner<T>>, item: T) -> Result<(), PutError<T>> {
        if inner.items.try_reserve(1).is_err() {
            return Err(PutError { kind: QueueError::OutOfMemory, item });
        }
        inner.items.push_back(item);
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// 入队；队列满时等待一次唤醒
    pub fn put(&self, item: T) -> Result<(), PutError<T>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PutError { kind: QueueError::Shutdown, item });
        }
        if Self::is_full(&inner) {
            inner.waiters += 1;
            self.cond.wait_for(&mut inner, self.put_wait);
            inner.waiters -= 1;
            if inner.closed {
                return Err(PutError { kind: QueueError::Shutdown, item });
            }
            if Self::is_full(&inner) {
                return Err(PutError { kind: QueueError::WouldBlock, item });
            }
        }
        self.push(inner, item)
    }

    /// 入队，不等待
    pub fn try_put(&self, item: T) -> Result<(), PutError<T>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(PutError { kind: QueueError::Shutdown, item });
        }
        if Self::is_full(&inner) {
            return Err(PutError { kind: QueueError::WouldBlock, item });
        }
        self.push(inner, item)
    }

    fn take(&self, mut inner: MutexGuard<'_, MailboxInner<T>>) -> Option<T> {
        let item = inner.items.pop_front();
        if item.is_some() {
            drop(inner);
            // 唤醒等待空位的 put 以及 wait_empty
            self.cond.notify_all();
        }
        item
    }

    /// 阻塞出队
    ///
    /// 队列关闭且为空时返回 `Shutdown`；被 `wake()` 唤醒且仍为空时返回 `WouldBlock`。
    pub fn get(&self) -> Result<T, QueueError> {
        let mut inner = self.inner.lock();
        let seq = inner.wake_seq;
        loop {
            if !inner.items.is_empty() {
                return self.take(inner).ok_or(QueueError::WouldBlock);
            }
            if inner.closed {
                return Err(QueueError::Shutdown);
            }
            if inner.wake_seq != seq {
                return Err(QueueError::WouldBlock);
            }
            inner.waiters += 1;
            self.cond.wait(&mut inner);
            inner.waiters -= 1;
        }
    }

    /// 带超时的出队，超时返回 `WouldBlock`
    pub fn timed_get(&self, timeout: Duration) -> Result<T, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let seq = inner.wake_seq;
        loop {
            if !inner.items.is_empty() {
                return self.take(inner).ok_or(QueueError::WouldBlock);
            }
            if inner.closed {
                return Err(QueueError::Shutdown);
            }
            if inner.wake_seq != seq {
                return Err(QueueError::WouldBlock);
            }
            inner.waiters += 1;
            let timed_out = self.cond.wait_until(&mut inner, deadline).timed_out();
            inner.waiters -= 1;
            if timed_out && inner.items.is_empty() {
                return if inner.closed {
                    Err(QueueError::Shutdown)
                } else {
                    Err(QueueError::WouldBlock)
                };
            }
        }
    }

    /// 不等待的出队
    pub fn try_get(&self) -> Result<T, QueueError> {
        let inner = self.inner.lock();
        if inner.items.is_empty() {
            return Err(if inner.closed { QueueError::Shutdown } else { QueueError::WouldBlock });
        }
        self.take(inner).ok_or(QueueError::WouldBlock)
    }

    /// 唤醒所有阻塞的读者和写者（不关闭队列）
    pub fn wake(&self) {
        let mut inner = self.inner.lock();
        inner.wake_seq = inner.wake_seq.wrapping_add(1);
        drop(inner);
        self.cond.notify_all();
    }

    /// 关闭队列并唤醒所有等待者
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// 修改容量；缩小容量不会丢弃已有元素
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        drop(inner);
        self.cond.notify_all();
    }

    /// 当前阻塞在队列上的线程数
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters
    }

    /// 等待队列变空，超时返回 false
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.items.is_empty() {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return inner.items.is_empty();
            }
        }
        true
    }

    /// 取出全部剩余元素
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let items: Vec<T> = inner.items.drain(..).collect();
        drop(inner);
        if !items.is_empty() {
            self.cond.notify_all();
        }
        items
    }
}

impl<T: Clone> Mailbox<T> {
    /// 查看队首元素但不移除
    ///
    /// `block == false` 时队列为空立即返回 `WouldBlock`。
    pub fn peek(&self, block: bool) -> Result<T, QueueError> {
        let mut inner = self.inner.lock();
        let seq = inner.wake_seq;
        loop {
            if let Some(item) = inner.items.front() {
                return Ok(item.clone());
            }
            if inner.closed {
                return Err(QueueError::Shutdown);
            }
            if !block || inner.wake_seq != seq {
                return Err(QueueError::WouldBlock);
            }
            inner.waiters += 1;
            self.cond.wait(&mut inner);
            inner.waiters -= 1;
        }
    }

    /// 带超时的 peek，超时返回 `WouldBlock`
    pub fn timed_peek(&self, timeout: Duration) -> Result<T, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let seq = inner.wake_seq;
        loop {
            if let Some(item) = inner.items.front() {
                return Ok(item.clone());
            }
            if inner.closed {
                return Err(QueueError::Shutdown);
            }
            if inner.wake_seq != seq {
                return Err(QueueError::WouldBlock);
            }
            inner.waiters += 1;
            let timed_out = self.cond.wait_until(&mut inner, deadline).timed_out();
            inner.waiters -= 1;
            if timed_out {
                return match inner.items.front() {
                    Some(item) => Ok(item.clone()),
                    None if inner.closed => Err(QueueError::Shutdown),
                    None => Err(QueueError::WouldBlock),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = Arc::new(Mailbox::new(0));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    q.put(i).unwrap();
                }
            })
        };
        for i in 0..1000 {
            assert_eq!(q.get().unwrap(), i);
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_backpressure() {
        let q = Mailbox::with_put_wait(3, Duration::from_millis(5));
        for i in 0..3 {
            q.put(i).unwrap();
        }
        let err = q.put(3).unwrap_err();
        assert_eq!(err.kind, QueueError::WouldBlock);
        assert_eq!(err.into_inner(), 3);

        assert_eq!(q.get().unwrap(), 0);
        q.put(3).unwrap();
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_close_drains_remaining_items() {
        let q = Mailbox::new(0);
        q.put("a").unwrap();
        q.put("b").unwrap();
        q.close();

        assert_eq!(q.put("c").unwrap_err().kind, QueueError::Shutdown);
        assert_eq!(q.get().unwrap(), "a");
        assert_eq!(q.get().unwrap(), "b");
        assert_eq!(q.get().unwrap_err(), QueueError::Shutdown);
        assert_eq!(q.try_put("d").unwrap_err().kind, QueueError::Shutdown);
    }

    #[test]
    fn test_close_wakes_blocked_getter() {
        let q: Arc<Mailbox<u32>> = Arc::new(Mailbox::new(0));
        let getter = {
            let q = q.clone();
            thread::spawn(move || q.get())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(getter.join().unwrap().unwrap_err(), QueueError::Shutdown);
    }

    #[test]
    fn test_wake_returns_would_block() {
        let q: Arc<Mailbox<u32>> = Arc::new(Mailbox::new(0));
        let getter = {
            let q = q.clone();
            thread::spawn(move || q.get())
        };
        while q.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        q.wake();
        assert_eq!(getter.join().unwrap().unwrap_err(), QueueError::WouldBlock);
        assert!(!q.is_closed());
    }

    #[test]
    fn test_timed_peek_and_peek() {
        let q = Mailbox::new(0);
        assert_eq!(q.timed_peek(Duration::from_millis(5)).unwrap_err(), QueueError::WouldBlock);
        assert_eq!(q.peek(false).unwrap_err(), QueueError::WouldBlock);
        q.put(7).unwrap();
        assert_eq!(q.peek(true).unwrap(), 7);
        assert_eq!(q.timed_peek(Duration::from_millis(5)).unwrap(), 7);
        assert_eq!(q.len(), 1);
        assert_eq!(q.timed_get(Duration::from_millis(5)).unwrap(), 7);
        assert_eq!(q.timed_get(Duration::from_millis(5)).unwrap_err(), QueueError::WouldBlock);
    }

    #[test]
    fn test_wait_empty() {
        let q = Arc::new(Mailbox::new(0));
        q.put(1).unwrap();
        q.put(2).unwrap();
        assert!(!q.wait_empty(Duration::from_millis(5)));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                q.get().unwrap();
                q.get().unwrap();
            })
        };
        assert!(q.wait_empty(Duration::from_secs(2)));
        consumer.join().unwrap();
    }

    #[test]
    fn test_set_capacity_unblocks_put() {
        let q = Mailbox::with_put_wait(1, Duration::from_millis(5));
        q.put(1).unwrap();
        assert_eq!(q.try_put(2).unwrap_err().kind, QueueError::WouldBlock);
        q.set_capacity(0);
        q.put(2).unwrap();
        assert_eq!(q.drain(), vec![1, 2]);
    }
}
