use parking_lot::Mutex;
use std::time::Instant;

/// 播放秒表（微秒）
///
/// 没有音频流、或音频解码已经退出时作为主时钟；其余时候主时钟是音频输出。
/// 停表用计数：缓冲和用户暂停各持有一次，全部释放后才继续走。
/// 新建的秒表已被持有一次，对应启动时的缓冲。
pub struct PlaybackClock {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    /// 上次起表 / 停表 / 设定时的读数
    base_us: i64,
    base_instant: Instant,
    holds: u32,
}

impl ClockInner {
    fn now(&self) -> i64 {
        if self.holds > 0 {
            self.base_us
        } else {
            self.base_us + self.base_instant.elapsed().as_micros() as i64
        }
    }

    fn rebase(&mut self, us: i64) {
        self.base_us = us;
        self.base_instant = Instant::now();
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClockInner { base_us: 0, base_instant: Instant::now(), holds: 1 }),
        }
    }

    pub fn now(&self) -> i64 {
        self.inner.lock().now()
    }

    /// 设定读数（seek、对齐到音频输出），不改变持有计数
    pub fn set_time(&self, us: i64) {
        self.inner.lock().rebase(us);
    }

    /// 持有一次；返回 true 表示这次让秒表停了下来
    pub fn hold(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = inner.now();
        inner.holds += 1;
        if inner.holds == 1 {
            inner.rebase(now);
            true
        } else {
            false
        }
    }

    /// 释放一次；返回 true 表示秒表重新开始走
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.holds == 0 {
            return false;
        }
        inner.holds -= 1;
        if inner.holds == 0 {
            let now = inner.base_us;
            inner.rebase(now);
            true
        } else {
            false
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.lock().holds > 0
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn new_clock_is_held() {
        let clock = PlaybackClock::new();
        clock.set_time(1_000);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now(), 1_000);
        assert!(clock.is_held());
    }

    #[test]
    fn nested_holds_release_in_any_order() {
        let clock = PlaybackClock::new();
        assert!(clock.release());
        thread::sleep(Duration::from_millis(20));

        // 缓冲中又被用户暂停
        assert!(clock.hold());
        assert!(!clock.hold());
        let frozen = clock.now();
        assert!(frozen >= 20_000);
        assert!(!clock.release());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.now(), frozen);

        assert!(clock.release());
        let resumed = clock.now();
        assert!(resumed >= frozen && resumed < frozen + 15_000);
        assert!(!clock.release());
        assert!(!clock.is_held());
    }

    #[test]
    fn set_time_keeps_running_state() {
        let clock = PlaybackClock::new();
        clock.release();
        clock.set_time(5_000_000);
        thread::sleep(Duration::from_millis(10));
        assert!(clock.now() > 5_000_000);
    }
}
