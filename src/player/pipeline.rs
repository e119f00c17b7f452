//! 一个播放周期的共享状态
//!
//! 控制线程和各阶段线程都持有同一个 `Arc<Pipeline>`：三个有界队列、
//! 四个检查点、flush 协议的状态，以及主时钟。会话字段（play_state 等）
//! 不在这里，它们只由控制线程修改。

use super::audio_output::AudioSink;
use super::backend::{MediaBackend, StreamProvider};
use super::buffering::{BufferLevel, BufferLevels};
use super::manager::PlayerCtl;
use super::presenter::VideoPresenter;
use crate::core::{
    log_ctx, FlushFlags, MediaInfo, Packet, PlaybackClock, PlayerConfig, QueueError, Stage, VideoFrame,
};
use crate::dispatch::{ActorRef, Checkpoint, Mailbox, MessageType, Pool};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 一次 flush 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flags: FlushFlags,
    /// 所有被 flush 的解码器都在超时前确认
    pub completed: bool,
    /// 已确认 flush 的解码器
    pub decoders_flushed: FlushFlags,
    pub audio_packets: usize,
    pub video_packets: usize,
    pub video_frames: usize,
    /// 被清掉的包里最新的时间戳
    pub newest_discarded: Option<i64>,
    pub elapsed: Duration,
}

impl FlushReport {
    /// 被 flush 的队列是否都已清空
    pub fn queues_empty(&self) -> bool {
        (!self.flags.contains(FlushFlags::AUDIO) || self.audio_packets == 0)
            && (!self.flags.contains(FlushFlags::VIDEO) || (self.video_packets == 0 && self.video_frames == 0))
    }
}

struct FlushState {
    requested: FlushFlags,
    flushed: FlushFlags,
    generation: u64,
    /// 仍在运行的解码器
    running: FlushFlags,
    newest_discarded: Option<i64>,
}

/// 带背压的入队结果；没有送出的元素交还给调用方
pub(crate) enum Push<T> {
    Sent,
    /// 等待期间发生了 flush，元素已经过时
    Dropped(T),
    Closed(T),
}

pub(crate) struct Pipeline {
    pub(crate) session: u64,
    pub(crate) player: ActorRef,
    pub(crate) config: PlayerConfig,
    pub(crate) info: MediaInfo,
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) provider: Arc<dyn StreamProvider>,
    pub(crate) presenter: Arc<dyn VideoPresenter>,
    pub(crate) frame_pool: Arc<Pool<VideoFrame>>,

    pub(crate) video_packets: Mailbox<Packet>,
    pub(crate) audio_packets: Mailbox<Packet>,
    pub(crate) video_frames: Mailbox<VideoFrame>,

    pub(crate) stream_cp: Checkpoint,
    pub(crate) audio_decode_cp: Checkpoint,
    pub(crate) video_decode_cp: Checkpoint,
    pub(crate) video_output_cp: Checkpoint,

    /// 没有音频时的主时钟
    pub(crate) clock: PlaybackClock,
    sink: OnceCell<Arc<dyn AudioSink>>,

    audio_track: AtomicI32,
    stopping: AtomicBool,
    stream_eof: AtomicBool,
    pending_seek: Mutex<Option<i64>>,
    flush: Mutex<FlushState>,
    flush_cond: Condvar,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: u64,
        player: ActorRef,
        config: PlayerConfig,
        info: MediaInfo,
        backend: Arc<dyn MediaBackend>,
        provider: Arc<dyn StreamProvider>,
        presenter: Arc<dyn VideoPresenter>,
        frame_pool: Arc<Pool<VideoFrame>>,
        audio_track: i32,
    ) -> Self {
        let put_wait = config.runtime.put_wait();
        let mut running = FlushFlags::empty();
        if info.has_audio {
            running |= FlushFlags::AUDIO;
        }
        if info.has_video {
            running |= FlushFlags::VIDEO;
        }

        let pipeline = Self {
            session,
            player,
            video_packets: Mailbox::with_put_wait(config.video_packet_capacity, put_wait),
            audio_packets: Mailbox::with_put_wait(config.audio_packet_capacity, put_wait),
            video_frames: Mailbox::with_put_wait(config.video_frame_capacity, put_wait),
            config,
            info,
            backend,
            provider,
            presenter,
            frame_pool,
            stream_cp: Checkpoint::new("stream-parse"),
            audio_decode_cp: Checkpoint::new("audio-decode"),
            video_decode_cp: Checkpoint::new("video-decode"),
            video_output_cp: Checkpoint::new("video-output"),
            clock: PlaybackClock::new(),
            sink: OnceCell::new(),
            audio_track: AtomicI32::new(audio_track),
            stopping: AtomicBool::new(false),
            stream_eof: AtomicBool::new(false),
            pending_seek: Mutex::new(None),
            flush: Mutex::new(FlushState {
                requested: FlushFlags::empty(),
                flushed: FlushFlags::empty(),
                generation: 0,
                running,
                newest_discarded: None,
            }),
            flush_cond: Condvar::new(),
        };
        for cp in pipeline.checkpoints() {
            cp.enable();
        }
        pipeline
    }

    fn checkpoints(&self) -> [&Checkpoint; 4] {
        [&self.stream_cp, &self.audio_decode_cp, &self.video_decode_cp, &self.video_output_cp]
    }

    /// 给播放器发控制消息
    pub(crate) fn notify(&self, ctl: PlayerCtl) {
        if let Err(e) = self.player.post(MessageType::Player, ctl) {
            debug!("{} 控制消息发送失败: {}", log_ctx(), e);
        }
    }

    /// 阶段准备完毕
    pub(crate) fn stage_ready(&self, stage: Stage) {
        self.notify(PlayerCtl::StageReady { session: self.session, stage });
    }

    pub(crate) fn sink(&self) -> Option<&Arc<dyn AudioSink>> {
        self.sink.get()
    }

    pub(crate) fn set_sink(&self, sink: Arc<dyn AudioSink>) -> bool {
        self.sink.set(sink).is_ok()
    }

    pub(crate) fn audio_track(&self) -> i32 {
        self.audio_track.load(Ordering::SeqCst)
    }

    pub(crate) fn set_audio_track(&self, track: i32) {
        self.audio_track.store(track, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stream_eof(&self) -> bool {
        self.stream_eof.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stream_eof(&self, eof: bool) {
        self.stream_eof.store(eof, Ordering::SeqCst);
        self.flush_cond.notify_all();
    }

    pub(crate) fn take_pending_seek(&self) -> Option<i64> {
        self.pending_seek.lock().take()
    }

    /// 主时钟：音频解码还在运行时取音频输出的时间，否则取视频秒表
    ///
    /// 音频播完后输出时间停止前进，剩下的视频帧按秒表呈现。
    pub(crate) fn master_time(&self) -> i64 {
        match self.sink() {
            Some(sink) if self.info.has_audio && self.decoders_running().contains(FlushFlags::AUDIO) => sink.gettime(),
            _ => self.clock.now(),
        }
    }

    /// 停住主时钟；缓冲和用户暂停可以叠加
    pub(crate) fn hold_clock(&self) {
        if self.clock.hold() {
            if let Some(sink) = self.sink() {
                sink.pause();
            }
        }
    }

    pub(crate) fn release_clock(&self) {
        if self.clock.release() {
            if let Some(sink) = self.sink() {
                sink.resume();
            }
        }
    }

    pub(crate) fn is_clock_held(&self) -> bool {
        self.clock.is_held()
    }

    pub(crate) fn reset_clock(&self, pos: i64) {
        self.clock.set_time(pos);
        if let Some(sink) = self.sink() {
            sink.set_clock(pos);
        }
    }

    pub(crate) fn levels(&self) -> BufferLevels {
        let (count, capacity) = self.provider.buffer_state();
        BufferLevels {
            stream: BufferLevel::new(count, capacity),
            audio: match self.sink() {
                Some(sink) if self.info.has_audio => {
                    let (buffered, capacity) = sink.buffered();
                    Some(BufferLevel::new(buffered, capacity))
                }
                _ => None,
            },
            video: self
                .info
                .has_video
                .then(|| BufferLevel::new(self.video_frames.len(), self.video_frames.capacity())),
            end_of_stream: self.is_stream_eof(),
        }
    }

    fn wake_all(&self) {
        self.video_packets.wake();
        self.audio_packets.wake();
        self.video_frames.wake();
    }

    pub(crate) fn flush_generation(&self) -> u64 {
        self.flush.lock().generation
    }

    /// 当前 flush 是否要求 `flag` 对应的解码器清空，且它还没有确认
    pub(crate) fn flush_pending(&self, flag: FlushFlags) -> bool {
        let st = self.flush.lock();
        st.requested.contains(flag) && !st.flushed.contains(flag)
    }

    pub(crate) fn mark_flushed(&self, flag: FlushFlags) {
        self.flush.lock().flushed |= flag;
        self.flush_cond.notify_all();
    }

    /// 清空一个包队列，返回丢弃的包数
    pub(crate) fn discard_packets(&self, queue: &Mailbox<Packet>) -> usize {
        let packets = queue.drain();
        if let Some(newest) = packets.iter().map(|p| p.pts).max() {
            let mut st = self.flush.lock();
            st.newest_discarded = Some(st.newest_discarded.map_or(newest, |n| n.max(newest)));
        }
        packets.len()
    }

    /// 等待 `generation` 之后的下一次 flush 完成，期间停在数据源检查点上
    ///
    /// 超时或流水线停止返回 false。
    pub(crate) fn wait_for_flush(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stopping() {
                return false;
            }
            self.stream_cp.here();
            let mut st = self.flush.lock();
            if st.generation != generation {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.flush_cond.wait_for(&mut st, self.config.checkpoint_wake());
        }
    }

    pub(crate) fn decoder_exited(&self, flag: FlushFlags) {
        if flag.contains(FlushFlags::AUDIO) {
            // 主时钟从音频输出切回秒表，接着音频的读数走
            if let Some(sink) = self.sink() {
                self.clock.set_time(sink.gettime());
            }
        }
        self.flush.lock().running.remove(flag);
        self.flush_cond.notify_all();
    }

    pub(crate) fn decoders_running(&self) -> FlushFlags {
        self.flush.lock().running
    }

    /// 清空并重新同步各阶段的缓冲，不销毁线程
    ///
    /// 1. 让数据源线程停在检查点
    /// 2. 设置 flush 标志，唤醒解码器
    /// 3. 等待被 flush 的解码器全部确认
    /// 4. 清除标志，放行数据源线程
    ///
    /// 只能在控制线程上调用。
    pub(crate) fn flush(&self, flags: FlushFlags, seek_to: Option<i64>) -> FlushReport {
        let started = Instant::now();
        let timeout = self.config.flush_timeout();
        let wake_interval = self.config.checkpoint_wake();
        info!("{} 🚿 flush {:?}，seek 目标: {:?}", log_ctx(), flags, seek_to);

        let halted = self.stream_cp.halt_sync(|| self.wake_all(), wake_interval, timeout);

        {
            let mut st = self.flush.lock();
            st.requested = flags;
            st.flushed = FlushFlags::empty();
            st.generation += 1;
            st.newest_discarded = None;
        }
        self.wake_all();
        if flags.contains(FlushFlags::AUDIO) {
            if let Some(sink) = self.sink() {
                sink.drop_samples();
            }
        }

        let deadline = Instant::now() + timeout;
        let mut st = self.flush.lock();
        let completed = loop {
            let expected = flags & st.running;
            if st.flushed.contains(expected) {
                break true;
            }
            if Instant::now() >= deadline || self.is_stopping() {
                break false;
            }
            MutexGuard::unlocked(&mut st, || self.wake_all());
            self.flush_cond.wait_for(&mut st, wake_interval);
        };
        st.requested = FlushFlags::empty();
        let decoders_flushed = st.flushed;
        drop(st);

        // 已退出的解码器不会自己清空队列
        if flags.contains(FlushFlags::AUDIO) {
            self.discard_packets(&self.audio_packets);
        }
        if flags.contains(FlushFlags::VIDEO) {
            self.discard_packets(&self.video_packets);
            for frame in self.video_frames.drain() {
                self.frame_pool.put(frame);
            }
        }
        if let Some(pos) = seek_to {
            *self.pending_seek.lock() = Some(pos);
            self.set_stream_eof(false);
        }

        let report = FlushReport {
            flags,
            completed: completed && halted,
            decoders_flushed,
            audio_packets: self.audio_packets.len(),
            video_packets: self.video_packets.len(),
            video_frames: self.video_frames.len(),
            newest_discarded: self.flush.lock().newest_discarded,
            elapsed: started.elapsed(),
        };
        self.stream_cp.continue_();

        if report.completed {
            info!("{} ✅ flush 完成，耗时 {:?}", log_ctx(), report.elapsed);
        } else {
            warn!(
                "⚠️ {} flush 未在 {:?} 内完成（数据源停下: {}，已确认: {:?}）",
                log_ctx(),
                timeout,
                halted,
                decoders_flushed
            );
        }
        report
    }

    /// 带背压的入队
    ///
    /// 队列满时反复重试；期间经过检查点停下过、或者发生了 `flush` 对应的清空请求，
    /// 元素就已经过时，交还给调用方丢弃。
    pub(crate) fn push<T>(&self, queue: &Mailbox<T>, item: T, cp: &Checkpoint, flush: FlushFlags) -> Push<T> {
        let generation = self.flush_generation();
        let mut item = item;
        loop {
            match queue.put(item) {
                Ok(()) => return Push::Sent,
                Err(e) => {
                    let kind = e.kind;
                    item = e.into_inner();
                    match kind {
                        QueueError::Shutdown => return Push::Closed(item),
                        QueueError::OutOfMemory => {
                            warn!("⚠️ {} 队列内存不足，丢弃", log_ctx());
                            return Push::Dropped(item);
                        }
                        QueueError::WouldBlock => {
                            if self.is_stopping() {
                                return Push::Closed(item);
                            }
                            let halted = cp.here();
                            if halted
                                || self.flush_generation() != generation
                                || (!flush.is_empty() && self.flush_pending(flush))
                            {
                                return Push::Dropped(item);
                            }
                        }
                    }
                }
            }
        }
    }

    /// 数据源读完后的等待
    ///
    /// 有新的 seek 请求返回 true；流水线停止或解码器都已退出返回 false。
    pub(crate) fn wait_after_eof(&self) -> bool {
        loop {
            if self.is_stopping() {
                return false;
            }
            self.stream_cp.here();
            if self.pending_seek.lock().is_some() {
                return true;
            }
            let mut st = self.flush.lock();
            if st.running.is_empty() {
                return false;
            }
            self.flush_cond.wait_for(&mut st, self.config.checkpoint_wake());
        }
    }

    /// 停止：关闭所有队列、禁用检查点、关闭音频输出，阻塞中的阶段线程都会醒来
    pub(crate) fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} 🛑 关闭流水线 #{}", log_ctx(), self.session);
        self.video_packets.close();
        self.audio_packets.close();
        self.video_frames.close();
        for cp in self.checkpoints() {
            cp.disable();
        }
        self.flush_cond.notify_all();
        if let Some(sink) = self.sink() {
            sink.shutdown();
        }
    }
}
