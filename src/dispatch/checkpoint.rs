use crate::core::log_ctx;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct CheckpointState {
    halt_requests: u32,
    enabled: bool,
    halted: bool,
}

/// 协作式暂停点
///
/// 监督方 `halt()` 之后，工作线程在下一次 `here()` 处停下，直到 `continue_()`。
/// 工作线程只应在自身状态一致的地方调用 `here()`（处理完一个单元、开始下一个之前）。
/// 初始为禁用状态；禁用时 `here()` 不阻塞，`disable()` 会放行所有等待者。
pub struct Checkpoint {
    name: &'static str,
    state: Mutex<CheckpointState>,
    halted_cond: Condvar,
    resume_cond: Condvar,
}

impl Checkpoint {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(CheckpointState { halt_requests: 0, enabled: false, halted: false }),
            halted_cond: Condvar::new(),
            resume_cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self) {
        let mut st = self.state.lock();
        st.enabled = true;
        drop(st);
        self.halted_cond.notify_all();
    }

    /// 禁用并放行所有等待者，之后的 halt 请求被忽略
    pub fn disable(&self) {
        let mut st = self.state.lock();
        st.enabled = false;
        st.halt_requests = 0;
        drop(st);
        self.halted_cond.notify_all();
        self.resume_cond.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// 请求工作线程在下一个暂停点停下
    pub fn halt(&self) {
        let mut st = self.state.lock();
        if !st.enabled {
            trace!("{} checkpoint {} 未启用，忽略 halt", log_ctx(), self.name);
            return;
        }
        st.halt_requests += 1;
    }

    /// 是否有未处理的 halt 请求
    pub fn halt_pending(&self) -> bool {
        self.state.lock().halt_requests > 0
    }

    /// 工作线程侧：有 halt 请求时阻塞，直到 continue 或 disable；返回是否停过
    pub fn here(&self) -> bool {
        let mut st = self.state.lock();
        if !st.enabled || st.halt_requests == 0 {
            return false;
        }
        st.halted = true;
        self.halted_cond.notify_all();
        trace!("{} ⏸️ checkpoint {} 已停下", log_ctx(), self.name);
        while st.enabled && st.halt_requests > 0 {
            self.resume_cond.wait(&mut st);
        }
        st.halted = false;
        trace!("{} ▶️ checkpoint {} 继续", log_ctx(), self.name);
        true
    }

    /// 监督方：等待工作线程停下；停下或被禁用时返回 true，超时返回 false
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.enabled && !st.halted {
            if self.halted_cond.wait_until(&mut st, deadline).timed_out() {
                return st.halted || !st.enabled;
            }
        }
        true
    }

    /// 撤销一个 halt 请求
    pub fn continue_(&self) {
        let mut st = self.state.lock();
        if st.halt_requests > 0 {
            st.halt_requests -= 1;
        }
        drop(st);
        self.resume_cond.notify_all();
    }

    pub fn halted(&self) -> bool {
        self.state.lock().halted
    }

    /// 完整的 halt 流程：请求暂停，然后反复唤醒工作线程可能阻塞的队列，直到它停下
    ///
    /// 超时返回 false，此时 halt 请求仍然保留，调用方需要 `continue_()`。
    pub fn halt_sync<F: Fn()>(&self, wake: F, wake_interval: Duration, timeout: Duration) -> bool {
        self.halt();
        let deadline = Instant::now() + timeout;
        loop {
            wake();
            if self.wait(wake_interval) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("⚠️ {} checkpoint {} 在 {:?} 内没有停下", log_ctx(), self.name, timeout);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_halt_and_continue() {
        let cp = Arc::new(Checkpoint::new("worker"));
        cp.enable();
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicUsize::new(0));
        let worker = {
            let (cp, stop, progress) = (cp.clone(), stop.clone(), progress.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    cp.here();
                    progress.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        cp.halt();
        assert!(cp.wait(Duration::from_secs(2)));
        assert!(cp.halted());
        let frozen = progress.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::SeqCst), frozen);

        cp.continue_();
        let deadline = Instant::now() + Duration::from_secs(2);
        while progress.load(Ordering::SeqCst) == frozen && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(progress.load(Ordering::SeqCst) > frozen);
        assert!(!cp.halted());

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
    }

    #[test]
    fn test_disabled_ignores_halt() {
        let cp = Checkpoint::new("idle");
        cp.halt();
        assert!(!cp.halt_pending());
        assert!(!cp.here());
        assert!(cp.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_disable_releases_worker() {
        let cp = Arc::new(Checkpoint::new("shutdown"));
        cp.enable();
        cp.halt();
        let worker = {
            let cp = cp.clone();
            thread::spawn(move || cp.here())
        };
        assert!(cp.wait(Duration::from_secs(2)));
        cp.disable();
        assert!(worker.join().unwrap());
        assert!(!cp.halted());
    }

    #[test]
    fn test_halt_sync_wakes_blocked_worker() {
        use crate::dispatch::Mailbox;
        let cp = Arc::new(Checkpoint::new("queue"));
        cp.enable();
        let q: Arc<Mailbox<u32>> = Arc::new(Mailbox::new(0));
        let worker = {
            let (cp, q) = (cp.clone(), q.clone());
            thread::spawn(move || loop {
                cp.here();
                match q.get() {
                    Ok(0) => break,
                    _ => continue,
                }
            })
        };
        let q2 = q.clone();
        assert!(cp.halt_sync(move || q2.wake(), Duration::from_millis(5), Duration::from_secs(2)));
        cp.continue_();
        q.put(0).unwrap();
        worker.join().unwrap();
    }
}
