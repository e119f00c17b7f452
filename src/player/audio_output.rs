use crate::core::{log_ctx, AudioFrame, PlayerError, Result};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 输出线程的消费周期
const TICK: Duration = Duration::from_millis(5);
/// 缓冲满时写入方单次等待的时间
const WRITE_WAIT: Duration = Duration::from_millis(20);

/// 音频输出回调事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEvent {
    /// 播放中缓冲被取空
    Underrun,
    /// 输出设备出错，无法继续
    CriticalError(String),
    /// 一次写入的采样已经全部播放
    PacketReleased,
}

pub type AudioCallback = Arc<dyn Fn(AudioEvent) + Send + Sync>;

/// 音频输出接口
///
/// 有音频流时它同时是主时钟：`gettime()` 只随实际播放出去的采样前进，
/// 暂停或欠载时停止。
pub trait AudioSink: Send + Sync {
    fn start(&self) -> Result<()>;

    /// 写入一帧；缓冲满时阻塞，`drop_samples()` 或 `shutdown()` 会让它提前返回
    ///
    /// 返回实际写入的采样帧数。
    fn write(&self, frame: &AudioFrame) -> Result<usize>;

    fn pause(&self);

    fn resume(&self);

    /// 丢弃缓冲中所有尚未播放的采样
    fn drop_samples(&self);

    /// 等待缓冲播完；超时返回 false
    fn drain(&self, timeout: Duration) -> bool;

    /// 当前播放位置（微秒）
    fn gettime(&self) -> i64;

    fn set_clock(&self, us: i64);

    fn is_paused(&self) -> bool;

    /// (已缓冲采样帧, 容量)
    fn buffered(&self) -> (usize, usize);

    fn set_callback(&self, callback: Option<AudioCallback>);

    fn shutdown(&self);
}

struct SinkState {
    ring: VecDeque<f32>,
    /// 容量（采样帧）
    capacity: usize,
    /// 每次写入结束时的累计采样数，用于判断写入何时播完
    writes: VecDeque<u64>,
    written_total: u64,
    consumed_total: u64,
    started: bool,
    paused: bool,
    closed: bool,
    /// drop_samples 每调用一次加一
    generation: u64,
    clock_base: i64,
    played_frames: u64,
    carry: f64,
    last_tick: Instant,
    underrun: bool,
}

struct SinkShared {
    sample_rate: u32,
    channels: u16,
    state: Mutex<SinkState>,
    cond: Condvar,
    callback: Mutex<Option<AudioCallback>>,
}

impl SinkShared {
    fn emit(&self, events: Vec<AudioEvent>) {
        if events.is_empty() {
            return;
        }
        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            for ev in events {
                cb(ev);
            }
        }
    }
}

/// 软件音频输出
///
/// 没有真实设备：输出线程按采样率的实时速度从环形缓冲中取走采样。
pub struct SoftwareAudioSink {
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftwareAudioSink {
    pub fn new(sample_rate: u32, channels: u16, buffer_ms: u64) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(PlayerError::AudioError(format!(
                "不支持的音频格式: {} Hz, {} 声道",
                sample_rate, channels
            )));
        }
        let capacity = ((sample_rate as u64 * buffer_ms) / 1000).max(1) as usize;
        info!(
            "{} 初始化音频输出: {} Hz, {} 声道, 缓冲 {} 帧",
            log_ctx(),
            sample_rate,
            channels,
            capacity
        );

        Ok(Self {
            shared: Arc::new(SinkShared {
                sample_rate,
                channels,
                state: Mutex::new(SinkState {
                    ring: VecDeque::new(),
                    capacity,
                    writes: VecDeque::new(),
                    written_total: 0,
                    consumed_total: 0,
                    started: false,
                    paused: false,
                    closed: false,
                    generation: 0,
                    clock_base: 0,
                    played_frames: 0,
                    carry: 0.0,
                    last_tick: Instant::now(),
                    underrun: false,
                }),
                cond: Condvar::new(),
                callback: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    /// 获取实际使用的音频配置
    pub fn get_config(&self) -> (u32, u16) {
        (self.shared.sample_rate, self.shared.channels)
    }
}

fn output_loop(shared: Arc<SinkShared>) {
    let ch = shared.channels as usize;
    let rate = shared.sample_rate as f64;
    loop {
        let mut events = Vec::new();
        {
            let mut st = shared.state.lock();
            if st.closed {
                break;
            }
            shared.cond.wait_for(&mut st, TICK);
            if st.closed {
                break;
            }
            let now = Instant::now();
            if st.started && !st.paused {
                st.carry += now.duration_since(st.last_tick).as_secs_f64() * rate;
                let due = st.carry.floor() as usize;
                if due > 0 {
                    st.carry -= due as f64;
                    let n = due.min(st.ring.len() / ch);
                    st.ring.drain(..n * ch);
                    st.played_frames += n as u64;
                    st.consumed_total += (n * ch) as u64;
                    while let Some(&end) = st.writes.front() {
                        if end > st.consumed_total {
                            break;
                        }
                        st.writes.pop_front();
                        events.push(AudioEvent::PacketReleased);
                    }
                    if n < due {
                        if !st.underrun {
                            st.underrun = true;
                            events.push(AudioEvent::Underrun);
                        }
                    } else {
                        st.underrun = false;
                    }
                    drop(st);
                    shared.cond.notify_all();
                    st = shared.state.lock();
                }
            }
            st.last_tick = now;
        }
        if events.contains(&AudioEvent::Underrun) {
            trace!("{} 🔇 音频缓冲欠载", log_ctx());
        }
        shared.emit(events);
    }
    debug!("{} 音频输出线程退出", log_ctx());
}

impl AudioSink for SoftwareAudioSink {
    fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Err(PlayerError::AudioError("音频输出已关闭".to_string()));
            }
            if st.started {
                return Ok(());
            }
            st.started = true;
            st.last_tick = Instant::now();
        }

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("audio-out".to_string())
            .spawn(move || output_loop(shared))
            .map_err(|e| PlayerError::AudioError(format!("创建音频输出线程失败: {}", e)))?;
        *worker = Some(handle);
        info!("{} 🔊 音频输出已启动", log_ctx());
        Ok(())
    }

    fn write(&self, frame: &AudioFrame) -> Result<usize> {
        if frame.channels != self.shared.channels || frame.sample_rate != self.shared.sample_rate {
            return Err(PlayerError::AudioError(format!(
                "音频格式不匹配: {} Hz/{} 声道，输出为 {} Hz/{} 声道",
                frame.sample_rate, frame.channels, self.shared.sample_rate, self.shared.channels
            )));
        }
        let ch = self.shared.channels as usize;
        let total = frame.data.len() - frame.data.len() % ch;

        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(PlayerError::AudioError("音频输出已关闭".to_string()));
        }
        let generation = st.generation;
        let mut offset = 0;
        while offset < total {
            let space = (st.capacity * ch).saturating_sub(st.ring.len());
            if space == 0 {
                self.shared.cond.wait_for(&mut st, WRITE_WAIT);
                if st.closed || st.generation != generation {
                    break;
                }
                continue;
            }
            let n = space.min(total - offset);
            if st.ring.try_reserve(n).is_err() {
                return Err(PlayerError::AudioError("音频缓冲内存不足".to_string()));
            }
            st.ring.extend(frame.data[offset..offset + n].iter().copied());
            st.written_total += n as u64;
            offset += n;
        }
        if offset > 0 && st.generation == generation {
            let end = st.written_total;
            st.writes.push_back(end);
        }
        Ok(offset / ch)
    }

    fn pause(&self) {
        let mut st = self.shared.state.lock();
        if !st.paused {
            st.paused = true;
            debug!("{} ⏸️ 音频输出暂停", log_ctx());
        }
    }

    fn resume(&self) {
        let mut st = self.shared.state.lock();
        if st.paused {
            st.paused = false;
            st.last_tick = Instant::now();
            debug!("{} ▶️ 音频输出继续", log_ctx());
        }
    }

    fn drop_samples(&self) {
        let mut st = self.shared.state.lock();
        let dropped = st.ring.len() / self.shared.channels as usize;
        st.generation += 1;
        st.ring.clear();
        st.writes.clear();
        st.consumed_total = st.written_total;
        st.carry = 0.0;
        st.underrun = false;
        drop(st);
        self.shared.cond.notify_all();
        debug!("{} 🗑️ 丢弃 {} 帧未播放的音频", log_ctx(), dropped);
    }

    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        while !st.ring.is_empty() && !st.closed {
            if self.shared.cond.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        st.ring.is_empty()
    }

    fn gettime(&self) -> i64 {
        let st = self.shared.state.lock();
        st.clock_base + (st.played_frames as i64 * 1_000_000) / self.shared.sample_rate as i64
    }

    fn set_clock(&self, us: i64) {
        let mut st = self.shared.state.lock();
        st.clock_base = us;
        st.played_frames = 0;
        st.carry = 0.0;
    }

    fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    fn buffered(&self) -> (usize, usize) {
        let st = self.shared.state.lock();
        (st.ring.len() / self.shared.channels as usize, st.capacity)
    }

    fn set_callback(&self, callback: Option<AudioCallback>) {
        *self.shared.callback.lock() = callback;
    }

    fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.ring.clear();
            st.writes.clear();
        }
        self.shared.cond.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("⚠️ {} 音频输出在自身线程上关闭", log_ctx());
            } else if handle.join().is_err() {
                warn!("⚠️ {} 音频输出线程 panic 退出", log_ctx());
            }
        }
        info!("{} 音频输出已停止", log_ctx());
    }
}

impl Drop for SoftwareAudioSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn frame(rate: u32, frames: usize) -> AudioFrame {
        AudioFrame { pts: 0, sample_rate: rate, channels: 1, data: vec![0.25; frames] }
    }

    #[test]
    fn test_clock_follows_played_samples() {
        let sink = SoftwareAudioSink::new(1000, 1, 100).unwrap();
        assert_eq!(sink.write(&frame(1000, 50)).unwrap(), 50);
        sink.set_clock(2_000_000);
        sink.start().unwrap();
        assert!(sink.drain(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(30));
        // 欠载后时钟停在最后一个采样
        assert_eq!(sink.gettime(), 2_050_000);
    }

    #[test]
    fn test_pause_freezes_clock() {
        let sink = SoftwareAudioSink::new(1000, 1, 1000).unwrap();
        sink.write(&frame(1000, 1000)).unwrap();
        sink.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        sink.pause();
        assert!(sink.is_paused());
        let frozen = sink.gettime();
        assert!(frozen > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.gettime(), frozen);

        sink.resume();
        thread::sleep(Duration::from_millis(40));
        assert!(sink.gettime() > frozen);
    }

    #[test]
    fn test_drop_samples_releases_blocked_writer() {
        let sink = Arc::new(SoftwareAudioSink::new(1000, 1, 10).unwrap());
        assert_eq!(sink.write(&frame(1000, 10)).unwrap(), 10);
        let writer = {
            let sink = sink.clone();
            thread::spawn(move || sink.write(&frame(1000, 10)))
        };
        thread::sleep(Duration::from_millis(50));
        sink.drop_samples();
        assert_eq!(writer.join().unwrap().unwrap(), 0);
        assert_eq!(sink.buffered(), (0, 10));
    }

    #[test]
    fn test_underrun_and_release_callbacks() {
        let sink = SoftwareAudioSink::new(1000, 1, 100).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        sink.set_callback(Some(Arc::new(move |ev| log.lock().push(ev))));

        sink.write(&frame(1000, 20)).unwrap();
        sink.write(&frame(1000, 20)).unwrap();
        sink.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !events.lock().contains(&AudioEvent::Underrun) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let events = events.lock();
        assert!(events.contains(&AudioEvent::Underrun));
        assert_eq!(events.iter().filter(|e| **e == AudioEvent::PacketReleased).count(), 2);
    }

    #[test]
    fn test_format_mismatch_and_shutdown() {
        let sink = SoftwareAudioSink::new(48000, 2, 100).unwrap();
        assert_eq!(sink.get_config(), (48000, 2));
        assert!(sink.write(&frame(44100, 10)).is_err());

        let called = Arc::new(AtomicBool::new(false));
        let c = called.clone();
        sink.set_callback(Some(Arc::new(move |_| c.store(true, Ordering::SeqCst))));
        sink.start().unwrap();
        sink.shutdown();
        let stereo = AudioFrame { pts: 0, sample_rate: 48000, channels: 2, data: vec![0.0; 4] };
        assert!(sink.write(&stereo).is_err());
        assert!(sink.start().is_err());
        assert!(SoftwareAudioSink::new(0, 2, 100).is_err());
    }
}
