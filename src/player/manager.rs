//! 播放器：控制线程上的状态机
//!
//! 播放器本身是绑定在 "player-control" 线程上的派发对象，所有控制请求
//! （用户操作、各阶段的就绪 / 退出通知、定时器）都是发给它的消息。
//! 会话字段只在控制线程上修改；对外查询的字段放在一把状态锁后面。
//!
//! 启动顺序：
//!
//! ```text
//! READY -> STREAM -> AUDIODEC -> VIDEODEC -> AUDIOOUT -> VIDEOOUT -> PLAYING
//! ```
//!
//! 每个阶段准备好后发回就绪消息，播放器才启动下一个阶段；缺少的流直接跳过。

use super::audio_output::AudioEvent;
use super::backend::MediaBackend;
use super::buffering::UnderrunMonitor;
use super::pipeline::{FlushReport, Pipeline};
use super::presenter::VideoPresenter;
use super::{decoder, demuxer_thread, video_output};
use crate::core::{
    log_ctx, AspectRatio, DispatchError, FlushFlags, PlayState, PlayerConfig, PlayerError, PlayerStatus, Rect,
    Result, SeekFlags, Stage, StatusData, TrackKind, VideoFrame,
};
use crate::dispatch::{
    self, timers, workqueue, ActorRef, AvThread, CastMode, Delegate, Dispatch, Handler, Message, MessageType,
    Pool, ThreadPriority, TimerData, TimerId, TimerKind,
};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 状态历史最多保留的条数
const HISTORY_LIMIT: usize = 64;

/// 播放器控制消息（`MessageType::Player` 的负载）
#[derive(Debug, Clone)]
pub enum PlayerCtl {
    /// 播放指定文件；`None` 表示从暂停恢复或重新播放上一个文件
    Play(Option<String>),
    Pause,
    Stop,
    Seek { flags: SeekFlags, pos: i64 },
    ChangeTrack { kind: TrackKind, track: i32 },
    Subscribe(ActorRef),
    Unsubscribe(ActorRef),
    Playlist { items: Vec<String>, selected: usize },
    /// 重新通知一次当前状态
    Update,

    // 各阶段上报
    SetTitle(String),
    SetDuration(i64),
    SetPosition(i64),
    AspectRatioChange(AspectRatio),
    BufferUpdate(u32),
    StreamExit,
    /// 数据流时间戳不连续
    Flush,
    AudioStreamUnderrun,
    BufferUnderrun,

    // 内部
    StageReady { session: u64, stage: Stage },
    ThreadExit { session: u64, stage: Stage, error: Option<String> },
    TeardownComplete { session: u64, joined: usize },
}

impl PlayerCtl {
    /// 线上编号
    pub fn code(&self) -> u32 {
        match self {
            PlayerCtl::Play(_) => 0x01,
            PlayerCtl::Pause => 0x02,
            PlayerCtl::Stop => 0x03,
            PlayerCtl::Seek { .. } => 0x04,
            PlayerCtl::ThreadExit { .. } => 0x05,
            PlayerCtl::StageReady { stage, .. } => match stage {
                Stage::StreamParse => 0x06,
                Stage::AudioDecode => 0x07,
                Stage::VideoDecode => 0x08,
                Stage::AudioOutput => 0x09,
                Stage::VideoOutput => 0x0A,
            },
            PlayerCtl::StreamExit => 0x0B,
            PlayerCtl::BufferUnderrun => 0x0C,
            PlayerCtl::AudioStreamUnderrun => 0x0D,
            PlayerCtl::AspectRatioChange(_) => 0x0E,
            PlayerCtl::ChangeTrack { .. } => 0x0F,
            PlayerCtl::Flush => 0x10,
            PlayerCtl::SetTitle(_) => 0x13,
            PlayerCtl::SetDuration(_) => 0x14,
            PlayerCtl::SetPosition(_) => 0x15,
            PlayerCtl::Update => 0x16,
            PlayerCtl::BufferUpdate(_) => 0x17,
            PlayerCtl::Subscribe(_) => 0x18,
            PlayerCtl::Unsubscribe(_) => 0x19,
            PlayerCtl::Playlist { .. } => 0x1A,
            PlayerCtl::TeardownComplete { .. } => 0x1B,
        }
    }
}

/// 播放器统计
#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    /// 启动过的播放周期
    pub sessions: u64,
    /// 开始的停止流程
    pub stops: u64,
    /// 完成的拆除
    pub teardowns: u64,
    pub flushes: u64,
    pub last_flush: Option<FlushReport>,
    /// 最近一次拆除时等到退出的阶段数
    pub last_teardown_joined: usize,
    /// 当前（或最近一个）播放周期的 play_state 变化
    pub state_history: Vec<PlayState>,
    pub status_history: Vec<PlayerStatus>,
}

struct SharedState {
    status: PlayerStatus,
    play_state: PlayState,
    stopping: bool,
    title: Option<String>,
    media_file: Option<String>,
    duration: i64,
    position: i64,
    aspect_ratio: AspectRatio,
    buffer_percent: u32,
    audio_track: i32,
    subpx_track: Option<i32>,
    last_error: Option<String>,
    pipeline: Option<Arc<Pipeline>>,
    stats: PlayerStats,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            status: PlayerStatus::Ready,
            play_state: PlayState::Ready,
            stopping: false,
            title: None,
            media_file: None,
            duration: 0,
            position: 0,
            aspect_ratio: AspectRatio::default(),
            buffer_percent: 0,
            audio_track: 0,
            subpx_track: None,
            last_error: None,
            pipeline: None,
            stats: PlayerStats::default(),
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<SharedState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock()
    }

    fn update<F: FnOnce(&mut SharedState)>(&self, f: F) {
        f(&mut self.state.lock());
        self.cond.notify_all();
    }
}

/// 各阶段的常驻线程，播放周期之间复用
struct StageThreads {
    stream: AvThread,
    audio: AvThread,
    video: AvThread,
    output: AvThread,
}

impl StageThreads {
    fn spawn(priority: ThreadPriority) -> Result<Self> {
        Ok(Self {
            stream: AvThread::spawn(Stage::StreamParse.as_str(), ThreadPriority::Normal)?,
            audio: AvThread::spawn(Stage::AudioDecode.as_str(), priority)?,
            video: AvThread::spawn(Stage::VideoDecode.as_str(), priority)?,
            output: AvThread::spawn(Stage::VideoOutput.as_str(), priority)?,
        })
    }

    fn get(&self, stage: Stage) -> &AvThread {
        match stage {
            Stage::StreamParse => &self.stream,
            Stage::AudioDecode | Stage::AudioOutput => &self.audio,
            Stage::VideoDecode => &self.video,
            Stage::VideoOutput => &self.output,
        }
    }

    fn join(self) {
        self.output.join();
        self.video.join();
        self.audio.join();
        self.stream.join();
    }
}

type StageJob = (Stage, Arc<Delegate<(), ()>>);

/// 一个播放周期
struct Session {
    id: u64,
    path: String,
    pipeline: Arc<Pipeline>,
    jobs: Vec<StageJob>,
    running: HashSet<Stage>,
    play_state: PlayState,
    stopping: bool,
    buffering: bool,
    user_paused: bool,
    monitor: UnderrunMonitor,
    timer: Option<TimerId>,
    /// 启动完成前收到的不连续通知，进入 PLAYING 后再 flush
    pending_flush: bool,
    /// 自然结束，拆除后播放列表前进
    advance_playlist: bool,
}

/// 阶段就绪时 play_state 应处的值
fn expected_state(stage: Stage) -> PlayState {
    match stage {
        Stage::StreamParse => PlayState::Stream,
        Stage::AudioDecode => PlayState::AudioDec,
        Stage::VideoDecode => PlayState::VideoDec,
        Stage::AudioOutput => PlayState::AudioOut,
        Stage::VideoOutput => PlayState::VideoOut,
    }
}

/// 拆除时的等待顺序：输出先于解码器，解码器先于数据源
fn teardown_rank(stage: Stage) -> u8 {
    match stage {
        Stage::VideoOutput => 0,
        Stage::AudioOutput => 1,
        Stage::VideoDecode => 2,
        Stage::AudioDecode => 3,
        Stage::StreamParse => 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChapterMove {
    Seek(i64),
    /// 切到播放列表的相邻项
    Item(isize),
}

/// 章节跳转的目标
fn chapter_target(chapters: &[i64], position: i64, incr: i64) -> ChapterMove {
    if chapters.is_empty() {
        return match incr.signum() {
            1 => ChapterMove::Item(1),
            -1 => ChapterMove::Item(-1),
            _ => ChapterMove::Seek(0),
        };
    }
    let last = chapters.len() - 1;
    let current = chapters.iter().rposition(|&start| start <= position).unwrap_or(0);
    let target = current as i64 + incr;
    if target > last as i64 {
        if current == last {
            ChapterMove::Item(1)
        } else {
            ChapterMove::Seek(chapters[last])
        }
    } else if target < 0 {
        if current == 0 {
            ChapterMove::Item(-1)
        } else {
            ChapterMove::Seek(chapters[0])
        }
    } else {
        ChapterMove::Seek(chapters[target as usize])
    }
}

/// 等待各阶段的任务结束，然后通知播放器拆除完成
fn reap(session: u64, player: ActorRef, jobs: &[StageJob], timeout: Duration) {
    let mut joined = 0;
    for (stage, job) in jobs {
        match job.wait_timeout(timeout) {
            Ok(()) => {
                joined += 1;
                debug!("{} 阶段 {} 已退出", log_ctx(), stage.as_str());
            }
            Err(DispatchError::Cancelled) => debug!("{} 阶段 {} 没有执行", log_ctx(), stage.as_str()),
            Err(e) => warn!("⚠️ {} 等待阶段 {} 退出失败: {}", log_ctx(), stage.as_str(), e),
        }
    }
    info!("{} 🧹 播放周期 #{} 的 {} 个阶段已退出", log_ctx(), session, joined);
    if let Err(e) = player.post(MessageType::Player, PlayerCtl::TeardownComplete { session, joined }) {
        debug!("{} 拆除完成通知发送失败: {}", log_ctx(), e);
    }
}

struct PlayerActor {
    this: Option<ActorRef>,
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    presenter: Arc<dyn VideoPresenter>,
    shared: Arc<Shared>,
    threads: Option<StageThreads>,
    frame_pool: Arc<Pool<VideoFrame>>,
    subscribers: Vec<ActorRef>,
    playlist: Vec<String>,
    playlist_pos: Option<usize>,
    /// 当前周期拆除后要播放的文件
    next_file: Option<String>,
    session: Option<Session>,
    next_session: u64,
    audio_track: Option<i32>,
    destroying: bool,
}

impl Handler for PlayerActor {
    fn handle(&mut self, this: ActorRef, msg: &Message) -> Dispatch {
        self.this = Some(this);
        match msg.kind() {
            MessageType::Player => {
                if let Some(ctl) = msg.payload::<PlayerCtl>() {
                    self.on_ctl(ctl.clone());
                }
                Dispatch::Ok
            }
            MessageType::Timer => {
                if let Some(data) = msg.payload::<TimerData>() {
                    self.on_timer(data.id);
                }
                Dispatch::Ok
            }
            MessageType::Destroy => self.on_destroy(),
            MessageType::Cleanup => {
                self.on_cleanup();
                Dispatch::Ok
            }
            other => {
                trace!("{} 播放器忽略消息 {:?}", log_ctx(), other);
                Dispatch::Continue
            }
        }
    }
}

impl PlayerActor {
    fn on_ctl(&mut self, ctl: PlayerCtl) {
        trace!("{} 📨 控制消息 0x{:02X}: {:?}", log_ctx(), ctl.code(), ctl);
        match ctl {
            PlayerCtl::Play(path) => self.on_play(path),
            PlayerCtl::Pause => self.on_pause(),
            PlayerCtl::Stop => self.stop("用户停止"),
            PlayerCtl::Seek { flags, pos } => self.on_seek(flags, pos),
            PlayerCtl::ChangeTrack { kind, track } => self.on_change_track(kind, track),
            PlayerCtl::Subscribe(actor) => {
                if !self.subscribers.contains(&actor) {
                    self.subscribers.push(actor);
                }
            }
            PlayerCtl::Unsubscribe(actor) => self.subscribers.retain(|a| *a != actor),
            PlayerCtl::Playlist { items, selected } => self.on_playlist(items, selected),
            PlayerCtl::Update => {
                let status = self.shared.lock().status;
                self.multicast_status(status, status);
            }
            PlayerCtl::SetTitle(title) => {
                info!("{} 🏷️ 标题: {}", log_ctx(), title);
                self.shared.update(|st| st.title = Some(title));
            }
            PlayerCtl::SetDuration(duration) => self.shared.update(|st| st.duration = duration),
            PlayerCtl::SetPosition(position) => self.shared.update(|st| st.position = position),
            PlayerCtl::AspectRatioChange(ratio) => {
                info!("{} 📐 宽高比变为 {}:{}", log_ctx(), ratio.num, ratio.den);
                self.presenter.set_aspect_ratio(ratio);
                self.shared.update(|st| st.aspect_ratio = ratio);
            }
            PlayerCtl::BufferUpdate(percent) => self.shared.update(|st| st.buffer_percent = percent.min(100)),
            PlayerCtl::StreamExit => {
                if let Some(s) = self.session.as_mut() {
                    s.advance_playlist = true;
                }
                self.stop("数据源结束");
            }
            PlayerCtl::Flush => self.on_discontinuity(),
            PlayerCtl::AudioStreamUnderrun => self.on_underrun("音频输出"),
            PlayerCtl::BufferUnderrun => self.on_underrun("数据源"),
            PlayerCtl::StageReady { session, stage } => self.on_stage_ready(session, stage),
            PlayerCtl::ThreadExit { session, stage, error } => self.on_thread_exit(session, stage, error),
            PlayerCtl::TeardownComplete { session, joined } => self.on_teardown_complete(session, joined),
        }
    }

    fn set_status(&mut self, new: PlayerStatus) {
        let old = {
            let mut st = self.shared.lock();
            let old = st.status;
            if old == new {
                return;
            }
            st.status = new;
            let history = &mut st.stats.status_history;
            if history.len() >= HISTORY_LIMIT {
                history.remove(0);
            }
            history.push(new);
            old
        };
        self.shared.cond.notify_all();
        info!("{} 📣 状态 {:?} -> {:?}", log_ctx(), old, new);
        self.multicast_status(old, new);
    }

    fn multicast_status(&mut self, old: PlayerStatus, new: PlayerStatus) {
        let Some(sender) = self.this else {
            return;
        };
        self.subscribers.retain(|s| s.is_alive());
        if self.subscribers.is_empty() {
            return;
        }
        let data = StatusData { sender, last_status: old, status: new };
        if let Err(e) = dispatch::send(&self.subscribers, MessageType::Player, CastMode::Multicast, Some(Arc::new(data))) {
            debug!("{} 状态通知发送失败: {}", log_ctx(), e);
        }
    }

    fn set_play_state(&mut self, new: PlayState) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let old = s.play_state;
        debug_assert!(new > old, "play_state 倒退: {:?} -> {:?}", old, new);
        s.play_state = new;
        info!("{} 🔁 play_state {} -> {}", log_ctx(), old.as_str(), new.as_str());
        self.shared.update(|st| {
            st.play_state = new;
            st.stats.state_history.push(new);
        });
    }

    fn on_play(&mut self, path: Option<String>) {
        enum Action {
            Resume,
            Switch(String),
            Start(String),
            Busy,
            Nothing,
        }

        let action = match (&self.session, path) {
            (Some(s), None) if !s.stopping && s.user_paused => Action::Resume,
            (Some(s), None) if !s.stopping => Action::Nothing,
            (Some(s), Some(p)) if !s.stopping && s.play_state == PlayState::Playing => Action::Switch(p),
            (Some(_), _) => Action::Busy,
            (None, Some(p)) => Action::Start(p),
            (None, None) => match self.shared.lock().media_file.clone() {
                Some(p) => Action::Start(p),
                None => Action::Nothing,
            },
        };

        match action {
            Action::Resume => self.resume(),
            Action::Switch(path) => {
                info!("{} 🔀 切换到 {}", log_ctx(), path);
                self.playlist_pos = self.playlist.iter().position(|p| *p == path);
                self.next_file = Some(path);
                self.stop("切换媒体");
            }
            Action::Start(path) => {
                if let Some(pos) = self.playlist.iter().position(|p| *p == path) {
                    self.playlist_pos = Some(pos);
                }
                self.start_play(path);
            }
            Action::Busy => {
                warn!("⚠️ {} 播放 / 停止流程正在进行，忽略播放请求", log_ctx());
                self.shared.update(|st| st.last_error = Some(PlayerError::Busy.to_string()));
            }
            Action::Nothing => debug!("{} 没有需要播放的内容", log_ctx()),
        }
    }

    fn fail_open(&mut self, path: &str, err: PlayerError) {
        error!("{} ❌ 无法播放 {}: {}", log_ctx(), path, err);
        self.shared.update(|st| st.last_error = Some(err.to_string()));
    }

    /// 打开数据源并启动数据源线程
    fn start_play(&mut self, path: String) {
        let Some(this) = self.this else {
            return;
        };
        info!("{} ▶️ 开始播放: {}", log_ctx(), path);

        let provider = match self.backend.open_stream(&path) {
            Ok(provider) => provider,
            Err(e) => return self.fail_open(&path, e),
        };
        let opened = self.backend.open_demuxer(&path, &provider).and_then(|demuxer| {
            let info = demuxer.media_info();
            if !info.has_audio && !info.has_video {
                return Err(PlayerError::OpenError("没有音频或视频流".to_string()));
            }
            provider.play(false)?;
            Ok(demuxer)
        });
        let demuxer = match opened {
            Ok(demuxer) => demuxer,
            Err(e) => {
                provider.close();
                provider.destroy();
                return self.fail_open(&path, e);
            }
        };
        info!("{} 📂 {}（{}）", log_ctx(), demuxer.description(), provider.description());

        let info = demuxer.media_info().clone();
        self.next_session += 1;
        let id = self.next_session;
        let track = match self.audio_track {
            Some(t) if info.audio_tracks.contains(&t) => t,
            _ => info.audio_tracks.first().copied().unwrap_or(0),
        };
        let pipeline = Arc::new(Pipeline::new(
            id,
            this,
            self.config.clone(),
            info.clone(),
            self.backend.clone(),
            provider,
            self.presenter.clone(),
            self.frame_pool.clone(),
            track,
        ));

        let mut monitor = UnderrunMonitor::new(self.config.low_watermark, self.config.high_watermark);
        monitor.start_buffering();
        self.session = Some(Session {
            id,
            path: path.clone(),
            pipeline: pipeline.clone(),
            jobs: Vec::new(),
            running: HashSet::new(),
            play_state: PlayState::Ready,
            stopping: false,
            buffering: true,
            user_paused: false,
            monitor,
            timer: None,
            pending_flush: false,
            advance_playlist: false,
        });
        self.shared.update(|st| {
            st.media_file = Some(path);
            st.title = info.title.clone();
            st.duration = info.duration;
            st.position = 0;
            st.aspect_ratio = info.aspect_ratio;
            st.buffer_percent = 0;
            st.audio_track = track;
            st.last_error = None;
            st.pipeline = Some(pipeline);
            st.stats.sessions += 1;
            st.stats.state_history.clear();
        });

        self.set_status(PlayerStatus::Buffering);
        self.set_play_state(PlayState::Stream);
        if let Err(e) = self.start_stage(Stage::StreamParse, move |pipe: &Pipeline| demuxer_thread::run(pipe, demuxer)) {
            self.fail_session(Stage::StreamParse, e);
        }
    }

    /// 在阶段线程上运行 `run`，结束后发回 THREAD_EXIT
    fn start_stage<F>(&mut self, stage: Stage, run: F) -> Result<()>
    where
        F: FnOnce(&Pipeline) -> Result<()> + Send + 'static,
    {
        let threads = self.threads.as_ref().ok_or(PlayerError::InvalidState("播放器已清理"))?;
        let session = self.session.as_mut().ok_or(PlayerError::InvalidState("没有活动的播放周期"))?;
        let pipe = session.pipeline.clone();
        let job = threads.get(stage).delegate(move || {
            let error = run(&pipe).err().map(|e| e.to_string());
            pipe.notify(PlayerCtl::ThreadExit { session: pipe.session, stage, error });
        })?;
        debug!("{} 🚀 启动阶段 {}", log_ctx(), stage.as_str());
        session.jobs.push((stage, job));
        session.running.insert(stage);
        Ok(())
    }

    fn fail_session(&mut self, stage: Stage, err: PlayerError) {
        error!("{} ❌ 阶段 {} 启动失败: {}", log_ctx(), stage.as_str(), err);
        self.shared.update(|st| st.last_error = Some(format!("{}: {}", stage.as_str(), err)));
        self.stop("阶段启动失败");
    }

    fn on_stage_ready(&mut self, session: u64, stage: Stage) {
        let (pipeline, state) = match self.session.as_ref() {
            Some(s) if s.id == session && !s.stopping => (s.pipeline.clone(), s.play_state),
            _ => {
                debug!("{} 忽略过期的就绪消息 {}（周期 #{}）", log_ctx(), stage.as_str(), session);
                return;
            }
        };
        if state != expected_state(stage) {
            warn!("⚠️ {} 阶段 {} 在 {} 状态下就绪，忽略", log_ctx(), stage.as_str(), state.as_str());
            return;
        }
        info!("{} ✅ 阶段 {} 就绪", log_ctx(), stage.as_str());

        let next = match stage {
            Stage::StreamParse => Some((PlayState::AudioDec, Stage::AudioDecode)),
            Stage::AudioDecode => Some((PlayState::VideoDec, Stage::VideoDecode)),
            Stage::VideoDecode => Some((PlayState::AudioOut, Stage::AudioOutput)),
            Stage::AudioOutput => Some((PlayState::VideoOut, Stage::VideoOutput)),
            Stage::VideoOutput => None,
        };
        let Some((state, next_stage)) = next else {
            return self.enter_playing();
        };
        self.set_play_state(state);

        let has_audio = pipeline.info.has_audio;
        let has_video = pipeline.info.has_video;
        // Ok(true)：下一阶段已经就绪（同步完成或没有对应的流）
        let result = match next_stage {
            Stage::AudioDecode if has_audio => self.start_stage(next_stage, decoder::run_audio).map(|()| false),
            Stage::VideoDecode if has_video => self.start_stage(next_stage, decoder::run_video).map(|()| false),
            Stage::VideoOutput if has_video => self.start_stage(next_stage, video_output::run).map(|()| false),
            Stage::AudioOutput if has_audio => self.open_audio_output(&pipeline).map(|()| true),
            _ => Ok(true),
        };
        match result {
            Ok(true) => self.on_stage_ready(session, next_stage),
            Ok(false) => {}
            Err(e) => self.fail_session(next_stage, e),
        }
    }

    /// AUDIOOUT 阶段：接上音频输出的回调并启动它
    fn open_audio_output(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        let sink = pipeline
            .sink()
            .cloned()
            .ok_or_else(|| PlayerError::AudioError("音频解码线程没有创建音频输出".to_string()))?;
        let player = pipeline.player;
        let session = pipeline.session;
        sink.set_callback(Some(Arc::new(move |event: AudioEvent| {
            let ctl = match event {
                AudioEvent::Underrun => PlayerCtl::AudioStreamUnderrun,
                AudioEvent::CriticalError(msg) => {
                    PlayerCtl::ThreadExit { session, stage: Stage::AudioOutput, error: Some(msg) }
                }
                AudioEvent::PacketReleased => return,
            };
            if let Err(e) = player.post(MessageType::Player, ctl) {
                trace!("{} 音频事件通知失败: {}", log_ctx(), e);
            }
        })));

        let held = self.session.as_ref().map(|s| s.pipeline.is_clock_held()).unwrap_or(true);
        if held {
            sink.pause();
        }
        sink.start()?;
        info!("{} 🔊 音频输出已启动（{}）", log_ctx(), if held { "等待缓冲" } else { "播放中" });
        Ok(())
    }

    fn enter_playing(&mut self) {
        self.set_play_state(PlayState::Playing);
        let Some(s) = self.session.as_mut() else {
            return;
        };
        match timers::register(self.config.underrun_check(), TimerKind::AutoReload, s.pipeline.player, None) {
            Ok(id) => s.timer = Some(id),
            Err(e) => warn!("⚠️ {} 无法启动缓冲检查定时器: {}", log_ctx(), e),
        }
        let finished = s.running.is_empty();
        let flush = std::mem::take(&mut s.pending_flush);
        info!("{} 🎬 播放周期 #{} 启动完成: {}", log_ctx(), s.id, s.path);

        if finished {
            s.advance_playlist = true;
            self.stop("播放结束");
        } else if flush {
            self.on_discontinuity();
        }
    }

    fn enter_buffering(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if s.buffering {
            return;
        }
        s.buffering = true;
        s.monitor.start_buffering();
        s.pipeline.hold_clock();
        let paused = s.user_paused;
        if !paused {
            self.set_status(PlayerStatus::Buffering);
        }
    }

    fn exit_buffering(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if !s.buffering {
            return;
        }
        s.buffering = false;
        s.pipeline.release_clock();
        let paused = s.user_paused;
        if !paused {
            self.set_status(PlayerStatus::Playing);
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if s.timer != Some(id) || s.stopping || s.play_state != PlayState::Playing {
            return;
        }
        let levels = s.pipeline.levels();
        let percent = levels.percent();
        // 数据源自己处理欠载，或者正故意卡住读取线程时，水位下降不进入缓冲
        let handled_by_stream = s.pipeline.provider.underrun_expected() || s.pipeline.provider.is_blocking();
        let change = if s.buffering || !handled_by_stream {
            s.monitor.update(&levels)
        } else {
            None
        };
        self.shared.update(|st| st.buffer_percent = percent);
        match change {
            Some(true) => self.enter_buffering(),
            Some(false) => self.exit_buffering(),
            None => {}
        }
    }

    fn on_underrun(&mut self, source: &str) {
        let Some(s) = self.session.as_ref() else {
            return;
        };
        if s.stopping || s.play_state != PlayState::Playing || s.user_paused || s.buffering {
            return;
        }
        if s.pipeline.provider.underrun_expected() {
            debug!("{} {} 欠载由数据源处理", log_ctx(), source);
            return;
        }
        if s.pipeline.is_stream_eof() {
            debug!("{} {} 欠载发生在数据源末尾，忽略", log_ctx(), source);
            return;
        }
        warn!("⚠️ {} {} 欠载，进入缓冲", log_ctx(), source);
        self.enter_buffering();
    }

    fn on_pause(&mut self) {
        let Some(s) = self.session.as_mut() else {
            debug!("{} 没有在播放，忽略暂停", log_ctx());
            return;
        };
        if s.stopping || s.play_state != PlayState::Playing || s.user_paused {
            debug!("{} 当前不能暂停（{}）", log_ctx(), s.play_state.as_str());
            return;
        }
        if !s.pipeline.provider.can_pause() {
            warn!("⚠️ {} 数据源不支持暂停", log_ctx());
            return;
        }
        s.user_paused = true;
        s.pipeline.hold_clock();
        if !s.pipeline.info.has_audio {
            s.pipeline.video_output_cp.halt();
        }
        info!("{} ⏸️ 暂停", log_ctx());
        self.set_status(PlayerStatus::Paused);
    }

    fn resume(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if !s.user_paused {
            return;
        }
        s.user_paused = false;
        if !s.pipeline.info.has_audio {
            s.pipeline.video_output_cp.continue_();
        }
        s.pipeline.release_clock();
        let status = if s.buffering { PlayerStatus::Buffering } else { PlayerStatus::Playing };
        info!("{} ▶️ 继续播放", log_ctx());
        self.set_status(status);
    }

    fn on_seek(&mut self, flags: SeekFlags, pos: i64) {
        let pipeline = match self.session.as_ref() {
            Some(s) if !s.stopping && s.play_state == PlayState::Playing => s.pipeline.clone(),
            _ => {
                debug!("{} 当前不能 seek，忽略", log_ctx());
                return;
            }
        };
        if pipeline.decoders_running().is_empty() {
            debug!("{} 解码器都已退出，忽略 seek", log_ctx());
            return;
        }

        let position = pipeline.master_time();
        let target = if flags.contains(SeekFlags::CHAPTER) {
            match chapter_target(&pipeline.info.chapters, position, pos) {
                ChapterMove::Seek(start) => start,
                ChapterMove::Item(step) => match self.next_playlist_item(step) {
                    Some(path) => {
                        info!("{} 📜 章节跳转到播放列表的相邻项: {}", log_ctx(), path);
                        self.next_file = Some(path);
                        self.stop("切换播放列表项");
                        return;
                    }
                    None if step < 0 => 0,
                    None => {
                        debug!("{} 已经是最后一章", log_ctx());
                        return;
                    }
                },
            }
        } else if flags.contains(SeekFlags::RELATIVE) {
            position + pos
        } else {
            pos
        };
        let duration = pipeline.info.duration;
        let target = if duration > 0 { target.clamp(0, duration) } else { target.max(0) };
        self.seek_to(target);
    }

    /// 暂停中的 seek 会恢复播放
    fn seek_to(&mut self, target: i64) {
        if self.session.as_ref().map(|s| s.user_paused).unwrap_or(false) {
            self.resume();
        }
        self.enter_buffering();
        let Some(pipeline) = self.session.as_ref().map(|s| s.pipeline.clone()) else {
            return;
        };

        info!("{} ⏩ Seek 到 {}us", log_ctx(), target);
        if let Err(e) = pipeline.provider.seek(SeekFlags::ABSOLUTE, target) {
            warn!("⚠️ {} 数据源 seek 失败: {}", log_ctx(), e);
        }
        let report = pipeline.flush(FlushFlags::ALL, Some(target));
        pipeline.reset_clock(target);
        self.shared.update(|st| {
            st.position = target;
            st.stats.flushes += 1;
            st.stats.last_flush = Some(report);
        });
    }

    fn on_discontinuity(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        if s.stopping {
            return;
        }
        if s.play_state != PlayState::Playing {
            s.pending_flush = true;
            return;
        }
        let pipeline = s.pipeline.clone();
        warn!("⚠️ {} 时间戳不连续，清空解码器", log_ctx());
        let report = pipeline.flush(FlushFlags::ALL, None);
        self.shared.update(|st| {
            st.stats.flushes += 1;
            st.stats.last_flush = Some(report);
        });
    }

    fn on_change_track(&mut self, kind: TrackKind, track: i32) {
        match kind {
            TrackKind::Subpicture => {
                info!("{} 💬 字幕轨道 -> {}", log_ctx(), track);
                self.shared.update(|st| st.subpx_track = Some(track));
            }
            TrackKind::Audio => {
                self.audio_track = Some(track);
                let pipeline = match self.session.as_ref() {
                    Some(s) if !s.stopping && s.play_state == PlayState::Playing => s.pipeline.clone(),
                    Some(_) => {
                        warn!("⚠️ {} 启动 / 停止过程中不能切换音轨", log_ctx());
                        return;
                    }
                    None => {
                        self.shared.update(|st| st.audio_track = track);
                        return;
                    }
                };
                if !pipeline.info.audio_tracks.contains(&track) {
                    warn!("⚠️ {} 音轨 {} 不存在（可用: {:?}）", log_ctx(), track, pipeline.info.audio_tracks);
                    return;
                }
                if pipeline.audio_track() == track {
                    return;
                }
                info!("{} 🔀 切换音轨 {} -> {}", log_ctx(), pipeline.audio_track(), track);
                let position = pipeline.master_time();
                pipeline.set_audio_track(track);
                self.shared.update(|st| st.audio_track = track);
                self.seek_to(position);
            }
        }
    }

    fn on_playlist(&mut self, items: Vec<String>, selected: usize) {
        if items.is_empty() {
            info!("{} 📜 清空播放列表", log_ctx());
            self.playlist.clear();
            self.playlist_pos = None;
            return;
        }
        let selected = selected.min(items.len() - 1);
        self.playlist = items;
        self.playlist_pos = Some(selected);
        let path = self.playlist[selected].clone();
        info!("{} 📜 播放列表 {} 项，从第 {} 项开始", log_ctx(), self.playlist.len(), selected + 1);

        match self.session.as_ref() {
            None => self.start_play(path),
            Some(s) if !s.stopping => {
                self.next_file = Some(path);
                self.stop("切换播放列表");
            }
            Some(_) => self.next_file = Some(path),
        }
    }

    fn next_playlist_item(&mut self, step: isize) -> Option<String> {
        let pos = self.playlist_pos? as isize + step;
        if pos < 0 || pos >= self.playlist.len() as isize {
            return None;
        }
        self.playlist_pos = Some(pos as usize);
        self.playlist.get(pos as usize).cloned()
    }

    fn on_thread_exit(&mut self, session: u64, stage: Stage, error: Option<String>) {
        let Some(s) = self.session.as_mut().filter(|s| s.id == session) else {
            debug!("{} 忽略过期的退出消息 {}（周期 #{}）", log_ctx(), stage.as_str(), session);
            return;
        };
        s.running.remove(&stage);
        let remaining = s.running.len();
        let stopping = s.stopping;

        match error {
            Some(err) => {
                error!("{} ❌ 阶段 {} 异常退出: {}", log_ctx(), stage.as_str(), err);
                if !stopping {
                    self.shared.update(|st| st.last_error = Some(format!("{}: {}", stage.as_str(), err)));
                    self.stop("阶段异常退出");
                }
            }
            None => {
                info!("{} 🏁 阶段 {} 退出（还有 {} 个在运行）", log_ctx(), stage.as_str(), remaining);
                if remaining == 0 && !stopping && s.play_state == PlayState::Playing {
                    s.advance_playlist = true;
                    self.stop("播放结束");
                }
            }
        }
    }

    /// 停止当前播放周期；重复调用不会再开始一次拆除
    fn stop(&mut self, reason: &str) {
        let Some(s) = self.session.as_mut() else {
            debug!("{} 没有活动的播放周期，忽略停止（{}）", log_ctx(), reason);
            return;
        };
        if s.stopping {
            debug!("{} 停止流程已在进行，忽略（{}）", log_ctx(), reason);
            return;
        }
        info!("{} ⏹️ 停止播放周期 #{}（{}）", log_ctx(), s.id, reason);
        s.stopping = true;
        if let Some(id) = s.timer.take() {
            timers::cancel(id);
        }
        s.pipeline.shutdown();
        s.pipeline.provider.close();

        let mut jobs = std::mem::take(&mut s.jobs);
        jobs.sort_by_key(|(stage, _)| teardown_rank(*stage));
        let session = s.id;
        let player = s.pipeline.player;
        let timeout = self.config.flush_timeout() * 2;
        self.shared.update(|st| {
            st.stopping = true;
            st.stats.stops += 1;
        });

        let jobs = Arc::new(jobs);
        let task_jobs = jobs.clone();
        match workqueue::delegate(move || reap(session, player, &task_jobs, timeout)) {
            Ok(task) => task.detach(),
            Err(e) => {
                warn!("⚠️ {} 工作线程池不可用（{}），在控制线程上等待各阶段退出", log_ctx(), e);
                reap(session, player, &jobs, timeout);
            }
        }
    }

    fn on_teardown_complete(&mut self, session: u64, joined: usize) {
        match self.session.as_ref() {
            Some(s) if s.id == session => {}
            _ => {
                debug!("{} 忽略过期的拆除完成消息（周期 #{}）", log_ctx(), session);
                return;
            }
        }
        let Some(s) = self.session.take() else {
            return;
        };
        s.pipeline.provider.destroy();
        let position = s.pipeline.master_time();
        let advance = s.advance_playlist;
        drop(s);

        self.shared.update(|st| {
            st.pipeline = None;
            st.position = position;
            st.play_state = PlayState::Ready;
            st.stopping = false;
            st.buffer_percent = 0;
            st.stats.teardowns += 1;
            st.stats.last_teardown_joined = joined;
            st.stats.state_history.push(PlayState::Ready);
        });
        info!("{} ✅ 播放周期 #{} 已拆除，回到 READY", log_ctx(), session);
        self.set_status(PlayerStatus::Ready);

        if self.destroying {
            return;
        }
        if let Some(next) = self.next_file.take() {
            self.start_play(next);
        } else if advance {
            match self.next_playlist_item(1) {
                Some(next) => self.start_play(next),
                None => debug!("{} 播放列表已结束", log_ctx()),
            }
        }
    }

    fn on_destroy(&mut self) -> Dispatch {
        self.destroying = true;
        self.next_file = None;
        if self.session.is_some() {
            self.stop("播放器销毁");
            return Dispatch::Continue;
        }
        Dispatch::Ok
    }

    fn on_cleanup(&mut self) {
        self.subscribers.clear();
        self.shared.update(|st| st.pipeline = None);
        if let Some(threads) = self.threads.take() {
            threads.join();
        }
        info!("{} 🧹 播放器已清理", log_ctx());
    }
}

/// 播放器句柄
///
/// 所有操作都是发给控制线程的异步消息；查询读取共享状态。
/// 释放句柄会停止播放并等待所有线程退出。
pub struct Player {
    actor: ActorRef,
    shared: Arc<Shared>,
    control: Option<AvThread>,
    destroy_timeout: Duration,
}

impl Player {
    pub fn new(backend: Arc<dyn MediaBackend>, presenter: Arc<dyn VideoPresenter>, config: PlayerConfig) -> Result<Self> {
        info!("{} 🎮 创建播放器...", log_ctx());
        let priority = if config.elevated_priority { ThreadPriority::High } else { ThreadPriority::Normal };
        let threads = StageThreads::spawn(priority)?;
        let control = AvThread::spawn("player-control", ThreadPriority::Normal)?;
        let shared = Arc::new(Shared::default());
        let frame_pool = Arc::new(Pool::new(config.video_frame_capacity + 4, VideoFrame::default));
        let destroy_timeout = config.runtime.destroy_retry() * (config.runtime.destroy_max_retries + 1);

        let handler = PlayerActor {
            this: None,
            config,
            backend,
            presenter,
            shared: shared.clone(),
            threads: Some(threads),
            frame_pool,
            subscribers: Vec::new(),
            playlist: Vec::new(),
            playlist_pos: None,
            next_file: None,
            session: None,
            next_session: 0,
            audio_track: None,
            destroying: false,
        };
        let actor = ActorRef::new_on(control.queue(), "player", handler)?;
        info!("{} ✅ 播放器创建完成", log_ctx());
        Ok(Self { actor, shared, control: Some(control), destroy_timeout })
    }

    fn send(&self, ctl: PlayerCtl) -> Result<()> {
        self.actor.post(MessageType::Player, ctl)?;
        Ok(())
    }

    /// 播放 `path`；`None` 从暂停恢复，或在 READY 时重新播放上一个文件
    ///
    /// 启动或停止流程进行中时返回 `Busy`。
    pub fn play(&self, path: Option<&str>) -> Result<()> {
        {
            let st = self.shared.lock();
            if st.stopping || (st.play_state > PlayState::Ready && st.play_state < PlayState::Playing) {
                return Err(PlayerError::Busy);
            }
        }
        self.send(PlayerCtl::Play(path.map(str::to_string)))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(PlayerCtl::Pause)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(PlayerCtl::Stop)
    }

    /// `pos` 的含义取决于 `flags`：绝对位置 / 相对偏移（微秒），或章节增量
    pub fn seek(&self, flags: SeekFlags, pos: i64) -> Result<()> {
        self.send(PlayerCtl::Seek { flags, pos })
    }

    pub fn seek_chapter(&self, incr: i64) -> Result<()> {
        self.seek(SeekFlags::CHAPTER, incr)
    }

    pub fn change_track(&self, kind: TrackKind, track: i32) -> Result<()> {
        self.send(PlayerCtl::ChangeTrack { kind, track })
    }

    /// 订阅状态变化（`MessageType::Player`，负载 [`StatusData`]）
    pub fn subscribe(&self, actor: ActorRef) -> Result<()> {
        self.send(PlayerCtl::Subscribe(actor))
    }

    pub fn unsubscribe(&self, actor: ActorRef) -> Result<()> {
        self.send(PlayerCtl::Unsubscribe(actor))
    }

    pub fn playlist(&self, items: Vec<String>, selected: usize) -> Result<()> {
        self.send(PlayerCtl::Playlist { items, selected })
    }

    pub fn update(&self) -> Result<()> {
        self.send(PlayerCtl::Update)
    }

    /// 播放器对象，可用来直接发送控制消息
    pub fn actor(&self) -> ActorRef {
        self.actor
    }

    pub fn status(&self) -> PlayerStatus {
        self.shared.lock().status
    }

    pub fn play_state(&self) -> PlayState {
        self.shared.lock().play_state
    }

    pub fn title(&self) -> Option<String> {
        self.shared.lock().title.clone()
    }

    pub fn media_file(&self) -> Option<String> {
        self.shared.lock().media_file.clone()
    }

    /// 总时长（微秒）
    pub fn duration(&self) -> i64 {
        self.shared.lock().duration
    }

    /// 当前位置（微秒）：播放中取主时钟
    pub fn position(&self) -> i64 {
        let (pipeline, position) = {
            let st = self.shared.lock();
            (st.pipeline.clone(), st.position)
        };
        match pipeline {
            Some(pipeline) => pipeline.master_time(),
            None => position,
        }
    }

    pub fn buffer_percent(&self) -> u32 {
        self.shared.lock().buffer_percent
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.shared.lock().aspect_ratio
    }

    pub fn audio_track(&self) -> i32 {
        self.shared.lock().audio_track
    }

    pub fn subpicture_track(&self) -> Option<i32> {
        self.shared.lock().subpx_track
    }

    /// 菜单高亮区域（由数据源提供）
    pub fn highlight(&self) -> Option<Rect> {
        let pipeline = self.shared.lock().pipeline.clone();
        pipeline.and_then(|p| p.provider.highlight())
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    pub fn stats(&self) -> PlayerStats {
        self.shared.lock().stats.clone()
    }

    /// 等待状态变为 `status`；超时返回 false
    pub fn wait_for_status(&self, status: PlayerStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while st.status != status {
            if self.shared.cond.wait_until(&mut st, deadline).timed_out() {
                return st.status == status;
            }
        }
        true
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        match self.actor.destroy() {
            Ok(handle) => {
                if !handle.wait(self.destroy_timeout) {
                    warn!("⚠️ {} 播放器没有在 {:?} 内完成清理", log_ctx(), self.destroy_timeout);
                }
            }
            Err(e) => debug!("{} 播放器对象已销毁: {}", log_ctx(), e),
        }
        if let Some(control) = self.control.take() {
            control.join();
        }
        info!("{} 👋 播放器已释放", log_ctx());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::presenter::ThreadPresenter;
    use crate::player::synthetic::{SyntheticBackend, SyntheticEvent};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(10);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn new_player(backend: &Arc<SyntheticBackend>) -> (Player, Arc<ThreadPresenter>) {
        init_logger();
        let presenter = Arc::new(ThreadPresenter::new(32, 18).unwrap());
        let player = Player::new(backend.clone(), presenter.clone(), PlayerConfig::default()).unwrap();
        (player, presenter)
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    const FULL_BOOTSTRAP: [PlayState; 6] = [
        PlayState::Stream,
        PlayState::AudioDec,
        PlayState::VideoDec,
        PlayState::AudioOut,
        PlayState::VideoOut,
        PlayState::Playing,
    ];

    #[test]
    fn test_ctl_codes() {
        assert_eq!(PlayerCtl::Play(None).code(), 0x01);
        assert_eq!(PlayerCtl::ThreadExit { session: 1, stage: Stage::VideoDecode, error: None }.code(), 0x05);
        assert_eq!(PlayerCtl::StageReady { session: 1, stage: Stage::VideoOutput }.code(), 0x0A);
        assert_eq!(PlayerCtl::Flush.code(), 0x10);
        assert_eq!(PlayerCtl::BufferUpdate(50).code(), 0x17);
    }

    #[test]
    fn test_chapter_target() {
        let chapters = [0, 1_000_000, 2_000_000];
        assert_eq!(chapter_target(&chapters, 500_000, 1), ChapterMove::Seek(1_000_000));
        assert_eq!(chapter_target(&chapters, 1_500_000, -1), ChapterMove::Seek(0));
        assert_eq!(chapter_target(&chapters, 0, 5), ChapterMove::Seek(2_000_000));
        assert_eq!(chapter_target(&chapters, 2_100_000, 1), ChapterMove::Item(1));
        assert_eq!(chapter_target(&chapters, 100, -1), ChapterMove::Item(-1));
        assert_eq!(chapter_target(&[], 100, 1), ChapterMove::Item(1));
    }

    #[test]
    fn test_end_to_end_play_pause_resume_stop() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, presenter) = new_player(&backend);

        let observer_thread = AvThread::spawn("status-observer", ThreadPriority::Normal).unwrap();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let observed = observed.clone();
            ActorRef::new_on(observer_thread.queue(), "observer", move |_this: ActorRef, msg: &Message| {
                if let Some(data) = msg.payload::<StatusData>() {
                    observed.lock().push(data.status);
                }
                Dispatch::Ok
            })
            .unwrap()
        };
        player.subscribe(observer).unwrap();

        player.play(Some("synthetic:duration=6000,fps=25,title=demo")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        let stats = player.stats();
        assert_eq!(&stats.status_history[..2], &[PlayerStatus::Buffering, PlayerStatus::Playing]);
        assert_eq!(stats.state_history, FULL_BOOTSTRAP.to_vec());
        assert_eq!(player.title().as_deref(), Some("demo"));
        assert_eq!(player.duration(), 6_000_000);

        thread::sleep(Duration::from_millis(200));
        player.pause().unwrap();
        assert!(player.wait_for_status(PlayerStatus::Paused, WAIT));
        let frozen = player.position();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(player.position(), frozen);

        player.play(None).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        let resumed = player.position();
        assert!(resumed >= frozen && resumed < frozen + 500_000, "{} vs {}", resumed, frozen);
        assert!(wait_until(WAIT, || player.position() > resumed));
        assert!(wait_until(WAIT, || presenter.frames_rendered() > 0));

        player.stop().unwrap();
        assert!(player.wait_for_status(PlayerStatus::Ready, WAIT));
        let stats = player.stats();
        assert_eq!(stats.teardowns, 1);
        assert_eq!(stats.last_teardown_joined, 4);
        assert_eq!(stats.state_history.last(), Some(&PlayState::Ready));
        assert_eq!(player.play_state(), PlayState::Ready);

        assert!(wait_until(WAIT, || observed.lock().len() >= 5));
        assert_eq!(
            *observed.lock(),
            vec![
                PlayerStatus::Buffering,
                PlayerStatus::Playing,
                PlayerStatus::Paused,
                PlayerStatus::Playing,
                PlayerStatus::Ready,
            ]
        );
        drop(player);
        drop(observer_thread);
    }

    #[test]
    fn test_bootstrap_skips_missing_streams() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        let path = "synthetic:duration=3000,audio=0";
        player.play(Some(path)).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        assert_eq!(player.stats().state_history, FULL_BOOTSTRAP.to_vec());
        assert_eq!(
            backend.drain_events(),
            vec![
                SyntheticEvent::StreamOpened(path.to_string()),
                SyntheticEvent::DemuxerOpened,
                SyntheticEvent::StreamPlay,
                SyntheticEvent::VideoDecoderCreated,
            ]
        );
        player.stop().unwrap();
        assert!(player.wait_for_status(PlayerStatus::Ready, WAIT));
        assert_eq!(player.stats().last_teardown_joined, 3);
        assert_eq!(backend.drain_events(), vec![SyntheticEvent::StreamClosed, SyntheticEvent::StreamDestroyed]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=5000")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));

        player.stop().unwrap();
        player.stop().unwrap();
        assert!(wait_until(WAIT, || player.stats().teardowns == 1));
        assert!(player.wait_for_status(PlayerStatus::Ready, WAIT));
        thread::sleep(Duration::from_millis(200));
        let stats = player.stats();
        assert_eq!(stats.stops, 1);
        assert_eq!(stats.teardowns, 1);

        // 再停一次没有任何效果
        player.stop().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(player.stats().stops, 1);
    }

    #[test]
    fn test_open_failure_stays_ready() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:fail_open=1")).unwrap();
        assert!(wait_until(WAIT, || player.last_error().is_some()));
        assert_eq!(player.status(), PlayerStatus::Ready);
        assert_eq!(player.play_state(), PlayState::Ready);
        assert_eq!(player.stats().sessions, 0);
    }

    #[test]
    fn test_decode_failure_tears_down() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=3000,audio=0,fail_video_at=5")).unwrap();
        assert!(wait_until(WAIT, || player.stats().teardowns == 1));
        assert_eq!(player.status(), PlayerStatus::Ready);
        let error = player.last_error().unwrap_or_default();
        assert!(error.starts_with("video-decode"), "{}", error);
        assert_eq!(player.stats().sessions, 1);
    }

    #[test]
    fn test_seek_flushes_pipeline() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=5000,chapters=1000")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));

        player.seek_chapter(1).unwrap();
        assert!(wait_until(WAIT, || player.stats().flushes == 1));
        let report = player.stats().last_flush.unwrap();
        assert!(report.completed);
        assert!(report.queues_empty());
        assert!(report.decoders_flushed.contains(FlushFlags::AUDIO | FlushFlags::VIDEO));
        let position = player.position();
        assert!((1_000_000..2_000_000).contains(&position), "{}", position);
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));

        player.seek(SeekFlags::RELATIVE, 1_000_000).unwrap();
        assert!(wait_until(WAIT, || player.stats().flushes == 2));
        assert!(player.position() >= 2_000_000);
        assert!(backend.drain_events().iter().any(|e| matches!(e, SyntheticEvent::StreamSeek(1_000_000))));
    }

    #[test]
    fn test_chapter_seek_moves_through_playlist() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        let items = vec![
            "synthetic:duration=3000,chapters=1000,title=first".to_string(),
            "synthetic:duration=3000,chapters=1000,title=second".to_string(),
        ];
        player.playlist(items.clone(), 0).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));

        // 先跳到最后一章，再往后就是播放列表的下一项
        player.seek_chapter(5).unwrap();
        player.seek_chapter(1).unwrap();
        assert!(wait_until(WAIT, || {
            player.media_file().as_deref() == Some(items[1].as_str()) && player.status() == PlayerStatus::Playing
        }));
        assert_eq!(player.title().as_deref(), Some("second"));
        assert_eq!(player.stats().sessions, 2);
    }

    #[test]
    fn test_playlist_advances_at_end_of_stream() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        let items = vec![
            "synthetic:duration=300,audio=0,title=a".to_string(),
            "synthetic:duration=300,title=b".to_string(),
        ];
        player.playlist(items.clone(), 0).unwrap();
        assert!(wait_until(Duration::from_secs(20), || player.stats().teardowns == 2));
        assert!(player.wait_for_status(PlayerStatus::Ready, WAIT));
        assert_eq!(player.media_file().as_deref(), Some(items[1].as_str()));
        assert_eq!(player.stats().sessions, 2);
        assert!(player.last_error().is_none());
    }

    #[test]
    fn test_discontinuity_flushes_once_playing() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=4000,audio=0,discontinuity_at=500")).unwrap();
        assert!(wait_until(WAIT, || player.stats().flushes == 1));
        let report = player.stats().last_flush.unwrap();
        assert!(report.completed);
        // 只清掉跳变之前读到的包
        assert!(report.newest_discarded.map_or(true, |pts| pts < 500_000), "{:?}", report.newest_discarded);
        assert_ne!(player.status(), PlayerStatus::Ready);
        assert!(wait_until(WAIT, || presenter.stats().last_pts.is_some_and(|pts| pts >= 500_000)));
    }

    #[test]
    fn test_audio_track_change_recreates_decoder() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=5000,video=0,tracks=2")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        assert_eq!(player.audio_track(), 1);

        player.change_track(TrackKind::Audio, 2).unwrap();
        let mut events = Vec::new();
        assert!(wait_until(WAIT, || {
            events.extend(backend.drain_events());
            events.contains(&SyntheticEvent::AudioDecoderCreated(2))
        }));
        assert!(wait_until(WAIT, || player.stats().flushes == 1));
        assert_eq!(player.audio_track(), 2);

        player.change_track(TrackKind::Subpicture, 3).unwrap();
        assert!(wait_until(WAIT, || player.subpicture_track() == Some(3)));
    }

    #[test]
    fn test_low_stream_level_enters_buffering() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.set_stream_level(100, 100);
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=20000")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        assert!(wait_until(WAIT, || player.position() > 0));

        backend.set_stream_level(5, 100);
        assert!(player.wait_for_status(PlayerStatus::Buffering, WAIT));
        // 缓冲期间音频输出暂停，时钟不走
        let frozen = player.position();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(player.position(), frozen);
        assert!(player.buffer_percent() < 20);

        backend.set_stream_level(100, 100);
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        assert!(wait_until(WAIT, || player.position() > frozen));
        let history = player.stats().status_history;
        assert_eq!(
            &history[history.len() - 3..],
            &[PlayerStatus::Playing, PlayerStatus::Buffering, PlayerStatus::Playing]
        );
    }

    #[test]
    fn test_stream_handled_underrun_keeps_playing() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.set_stream_level(100, 100);
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=20000,underrun=1")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));

        backend.set_stream_level(0, 100);
        assert!(wait_until(WAIT, || player.buffer_percent() == 0));
        let before = player.position();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(player.status(), PlayerStatus::Playing);
        assert!(player.position() > before);
        assert!(!player.stats().status_history.ends_with(&[PlayerStatus::Buffering]));
    }

    #[test]
    fn test_blocking_stream_is_not_an_underrun() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.set_stream_level(100, 100);
        let (player, _presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=20000")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));

        backend.set_blocking(true);
        backend.set_stream_level(0, 100);
        assert!(wait_until(WAIT, || player.buffer_percent() == 0));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(player.status(), PlayerStatus::Playing);

        // 不再阻塞后同样的水位就是欠载
        backend.set_blocking(false);
        assert!(player.wait_for_status(PlayerStatus::Buffering, WAIT));
    }

    #[test]
    fn test_pause_without_audio_halts_video_output() {
        let backend = Arc::new(SyntheticBackend::new());
        let (player, presenter) = new_player(&backend);
        player.play(Some("synthetic:duration=10000,audio=0")).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        assert!(wait_until(WAIT, || presenter.frames_rendered() > 0));

        player.pause().unwrap();
        assert!(player.wait_for_status(PlayerStatus::Paused, WAIT));
        // 正在呈现的那一帧可能还会落下
        thread::sleep(Duration::from_millis(100));
        let rendered = presenter.frames_rendered();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(presenter.frames_rendered(), rendered);

        player.play(None).unwrap();
        assert!(player.wait_for_status(PlayerStatus::Playing, WAIT));
        assert!(wait_until(WAIT, || presenter.frames_rendered() > rendered));
    }
}
