use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// 对象池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 新分配的对象数
    pub allocated: u64,
    /// 从空闲列表复用的次数
    pub reused: u64,
    /// 空闲列表已满被直接释放的对象数
    pub discarded: u64,
}

/// 回收池
///
/// 空闲列表有自己的锁，只在 `get` / `put` 内部短暂持有，从不与对象锁或队列锁嵌套。
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    max_free: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl<T> Pool<T> {
    pub fn new<F>(max_free: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            free: Mutex::new(Vec::new()),
            max_free,
            factory: Box::new(factory),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// 取一个对象，空闲列表为空时新建
    pub fn get(&self) -> T {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(item) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        }
    }

    /// 归还对象
    pub fn put(&self, item: T) {
        let mut free = self.free.lock();
        if free.len() < self.max_free && free.try_reserve(1).is_ok() {
            free.push(item);
        } else {
            drop(free);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycles_up_to_limit() {
        let pool = Pool::new(2, || Vec::<u8>::with_capacity(16));
        let a = pool.get();
        let b = pool.get();
        let c = pool.get();
        pool.put(a);
        pool.put(b);
        pool.put(c);
        assert_eq!(pool.free_count(), 2);

        let d = pool.get();
        assert!(d.capacity() >= 16);
        assert_eq!(
            pool.stats(),
            PoolStats { allocated: 3, reused: 1, discarded: 1 }
        );
    }
}
