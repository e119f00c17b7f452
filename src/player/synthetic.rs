//! 合成媒体后端
//!
//! 不依赖任何编解码库：按路径里的参数生成带时间戳的音视频包和帧，
//! 支持故障注入，用于流水线测试和演示程序。
//!
//! 路径格式：`synthetic:duration=2000,fps=25,audio=1,video=1,chapters=500`
//!
//! | 参数 | 含义 | 默认 |
//! |------|------|------|
//! | duration | 时长（毫秒） | 2000 |
//! | fps | 帧率 | 25 |
//! | audio / video | 是否包含该流 | 1 |
//! | tracks | 音轨数量（编号从 1 开始） | 1 |
//! | rate / channels | 音频格式 | 48000 / 2 |
//! | width / height | 画面尺寸 | 16 / 9 |
//! | chapters | 章节间隔（毫秒） | 无 |
//! | title | 标题 | 无 |
//! | fail_open | 打开时失败 | 0 |
//! | fail_video_at / fail_audio_at | 第 N 个包解码失败 | 无 |
//! | discontinuity_at | 在该时间（毫秒）插入一次时间戳跳变 | 无 |
//! | underrun | 数据源自己处理欠载，播放器不进入缓冲 | 0 |
//! | pausable | 数据源可以暂停 | 1 |
//!
//! 数据源的缓冲水位和阻塞状态不在路径里，测试通过 [`SyntheticBackend::set_stream_level`]
//! 和 [`SyntheticBackend::set_blocking`] 随时调整。

use super::audio_output::{AudioSink, SoftwareAudioSink};
use super::backend::{AudioDecoder, DemuxEvent, Demuxer, MediaBackend, StreamProvider, VideoDecoder};
use crate::core::{
    log_ctx, AspectRatio, AudioFrame, MediaInfo, Packet, PacketKind, PixelFormat, PlayerConfig, PlayerError, Result,
    SeekFlags, VideoFrame,
};
use crate::dispatch::Pool;
use crossbeam::queue::SegQueue;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SCHEME: &str = "synthetic:";

/// 音频包时长（微秒）
const AUDIO_PACKET_US: i64 = 20_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    pub duration_ms: i64,
    pub fps: u32,
    pub audio: bool,
    pub video: bool,
    pub tracks: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    pub chapter_ms: Option<i64>,
    pub title: Option<String>,
    pub fail_open: bool,
    pub fail_video_at: Option<u64>,
    pub fail_audio_at: Option<u64>,
    pub discontinuity_at_ms: Option<i64>,
    pub underrun: bool,
    pub pausable: bool,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            duration_ms: 2000,
            fps: 25,
            audio: true,
            video: true,
            tracks: 1,
            sample_rate: 48000,
            channels: 2,
            width: 16,
            height: 9,
            chapter_ms: None,
            title: None,
            fail_open: false,
            fail_video_at: None,
            fail_audio_at: None,
            discontinuity_at_ms: None,
            underrun: false,
            pausable: true,
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PlayerError::OpenError(format!("参数 {} 的值无效: {}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(PlayerError::OpenError(format!("参数 {} 的值无效: {}", key, value))),
    }
}

impl SyntheticSpec {
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix(SCHEME)
            .ok_or_else(|| PlayerError::OpenError(format!("不是合成媒体路径: {}", path)))?;

        let mut spec = SyntheticSpec::default();
        for pair in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PlayerError::OpenError(format!("参数格式应为 key=value: {}", pair)))?;
            match key {
                "duration" => spec.duration_ms = parse_num(key, value)?,
                "fps" => spec.fps = parse_num(key, value)?,
                "audio" => spec.audio = parse_flag(key, value)?,
                "video" => spec.video = parse_flag(key, value)?,
                "tracks" => spec.tracks = parse_num(key, value)?,
                "rate" => spec.sample_rate = parse_num(key, value)?,
                "channels" => spec.channels = parse_num(key, value)?,
                "width" => spec.width = parse_num(key, value)?,
                "height" => spec.height = parse_num(key, value)?,
                "chapters" => spec.chapter_ms = Some(parse_num(key, value)?),
                "title" => spec.title = Some(value.to_string()),
                "fail_open" => spec.fail_open = parse_flag(key, value)?,
                "fail_video_at" => spec.fail_video_at = Some(parse_num(key, value)?),
                "fail_audio_at" => spec.fail_audio_at = Some(parse_num(key, value)?),
                "discontinuity_at" => spec.discontinuity_at_ms = Some(parse_num(key, value)?),
                "underrun" => spec.underrun = parse_flag(key, value)?,
                "pausable" => spec.pausable = parse_flag(key, value)?,
                _ => return Err(PlayerError::OpenError(format!("未知参数: {}", key))),
            }
        }

        if spec.duration_ms < 0 || spec.fps == 0 || spec.tracks == 0 {
            return Err(PlayerError::OpenError(format!("参数超出范围: {}", path)));
        }
        if spec.video && (spec.width == 0 || spec.height == 0) {
            return Err(PlayerError::OpenError(format!("画面尺寸无效: {}x{}", spec.width, spec.height)));
        }
        Ok(spec)
    }

    pub fn media_info(&self) -> MediaInfo {
        let duration = self.duration_ms * 1000;
        let chapters = match self.chapter_ms {
            Some(step) if step > 0 => (0..).map(|i| i * step * 1000).take_while(|c| *c < duration).collect(),
            _ => Vec::new(),
        };
        MediaInfo {
            duration,
            title: self.title.clone(),
            width: if self.video { self.width } else { 0 },
            height: if self.video { self.height } else { 0 },
            fps: if self.video { self.fps as f64 } else { 0.0 },
            has_audio: self.audio,
            has_video: self.video,
            audio_tracks: if self.audio { (1..=self.tracks as i32).collect() } else { Vec::new() },
            chapters,
            sample_rate: self.sample_rate,
            channels: self.channels,
            aspect_ratio: if self.video {
                AspectRatio { num: self.width, den: self.height }
            } else {
                AspectRatio::default()
            },
        }
    }

    fn frame_duration(&self) -> i64 {
        1_000_000 / self.fps as i64
    }
}

/// 后端内部事件，测试用来核对调用顺序
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticEvent {
    StreamOpened(String),
    StreamPlay,
    StreamSeek(i64),
    StreamClosed,
    StreamDestroyed,
    DemuxerOpened,
    AudioDecoderCreated(i32),
    AudioSinkCreated,
    VideoDecoderCreated,
}

type EventLog = Arc<SegQueue<SyntheticEvent>>;

/// 测试在播放过程中可以改动的数据源状态
#[derive(Default)]
struct StreamControl {
    /// (count, capacity)
    level: Mutex<(usize, usize)>,
    blocking: AtomicBool,
}

/// 合成媒体后端
///
/// 解码器的故障注入参数取自最近一次打开的路径。
#[derive(Default)]
pub struct SyntheticBackend {
    events: EventLog,
    current: Mutex<Option<SyntheticSpec>>,
    control: Arc<StreamControl>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出目前为止记录的所有事件
    pub fn drain_events(&self) -> Vec<SyntheticEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.events.pop() {
            events.push(ev);
        }
        events
    }

    /// 设置数据源缓冲水位；capacity 为 0 时不参与欠载判断
    pub fn set_stream_level(&self, count: usize, capacity: usize) {
        *self.control.level.lock() = (count, capacity);
    }

    /// 模拟数据源卡住读取线程
    pub fn set_blocking(&self, blocking: bool) {
        self.control.blocking.store(blocking, Ordering::SeqCst);
    }

    fn faults(&self) -> (Option<u64>, Option<u64>) {
        match self.current.lock().as_ref() {
            Some(spec) => (spec.fail_audio_at, spec.fail_video_at),
            None => (None, None),
        }
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_stream(&self, path: &str) -> Result<Arc<dyn StreamProvider>> {
        let spec = SyntheticSpec::parse(path)?;
        if spec.fail_open {
            return Err(PlayerError::OpenError(format!("无法打开 {}（注入的错误）", path)));
        }
        self.events.push(SyntheticEvent::StreamOpened(path.to_string()));
        info!("{} 🌐 打开合成数据源: {}", log_ctx(), path);
        Ok(Arc::new(SyntheticProvider {
            path: path.to_string(),
            underrun: spec.underrun,
            pausable: spec.pausable,
            closed: AtomicBool::new(false),
            events: self.events.clone(),
            control: self.control.clone(),
        }))
    }

    fn open_demuxer(&self, path: &str, _provider: &Arc<dyn StreamProvider>) -> Result<Box<dyn Demuxer>> {
        let spec = SyntheticSpec::parse(path)?;
        *self.current.lock() = Some(spec.clone());
        self.events.push(SyntheticEvent::DemuxerOpened);
        Ok(Box::new(SyntheticDemuxer::new(spec)))
    }

    fn audio_decoder(&self, info: &MediaInfo, track: i32) -> Result<Box<dyn AudioDecoder>> {
        if !info.audio_tracks.contains(&track) {
            return Err(PlayerError::DecodeError(format!("音轨 {} 不存在", track)));
        }
        self.events.push(SyntheticEvent::AudioDecoderCreated(track));
        Ok(Box::new(SyntheticAudioDecoder {
            sample_rate: info.sample_rate,
            channels: info.channels,
            decoded: 0,
            phase: 0.0,
            fail_at: self.faults().0,
        }))
    }

    fn video_decoder(&self, info: &MediaInfo, frames: Arc<Pool<VideoFrame>>) -> Result<Box<dyn VideoDecoder>> {
        self.events.push(SyntheticEvent::VideoDecoderCreated);
        Ok(Box::new(SyntheticVideoDecoder {
            pool: frames,
            width: info.width,
            height: info.height,
            decoded: 0,
            fail_at: self.faults().1,
        }))
    }

    fn audio_sink(&self, info: &MediaInfo, config: &PlayerConfig) -> Result<Arc<dyn AudioSink>> {
        self.events.push(SyntheticEvent::AudioSinkCreated);
        Ok(Arc::new(SoftwareAudioSink::new(info.sample_rate, info.channels, config.audio_buffer_ms)?))
    }
}

struct SyntheticProvider {
    path: String,
    underrun: bool,
    pausable: bool,
    closed: AtomicBool,
    events: EventLog,
    control: Arc<StreamControl>,
}

impl StreamProvider for SyntheticProvider {
    fn play(&self, _skip_to_menu: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlayerError::InvalidState("数据源已关闭"));
        }
        self.events.push(SyntheticEvent::StreamPlay);
        Ok(())
    }

    fn seek(&self, _flags: SeekFlags, pos: i64) -> Result<()> {
        self.events.push(SyntheticEvent::StreamSeek(pos));
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.push(SyntheticEvent::StreamClosed);
        }
    }

    fn destroy(&self) {
        self.events.push(SyntheticEvent::StreamDestroyed);
    }

    fn buffer_state(&self) -> (usize, usize) {
        *self.control.level.lock()
    }

    fn underrun_expected(&self) -> bool {
        self.underrun
    }

    fn is_blocking(&self) -> bool {
        self.control.blocking.load(Ordering::SeqCst)
    }

    fn can_pause(&self) -> bool {
        self.pausable
    }

    fn description(&self) -> String {
        format!("SyntheticStream({})", self.path)
    }
}

/// 按时间戳顺序交错产生音视频包
pub struct SyntheticDemuxer {
    spec: SyntheticSpec,
    info: MediaInfo,
    next_video: i64,
    next_audio: i64,
    video_index: u64,
    audio_index: u64,
    pending: VecDeque<Packet>,
    discontinuity_sent: bool,
}

impl SyntheticDemuxer {
    pub fn new(spec: SyntheticSpec) -> Self {
        let info = spec.media_info();
        Self {
            spec,
            info,
            next_video: 0,
            next_audio: 0,
            video_index: 0,
            audio_index: 0,
            pending: VecDeque::new(),
            discontinuity_sent: false,
        }
    }
}

impl Demuxer for SyntheticDemuxer {
    fn read_packet(&mut self) -> Result<Option<DemuxEvent>> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(DemuxEvent::Packet(packet)));
        }

        let duration = self.info.duration;
        let video = (self.spec.video && self.next_video < duration).then_some(self.next_video);
        let audio = (self.spec.audio && self.next_audio < duration).then_some(self.next_audio);
        let next = match (video, audio) {
            (None, None) => return Ok(None),
            (Some(v), Some(a)) => v.min(a),
            (Some(v), None) => v,
            (None, Some(a)) => a,
        };

        if let Some(at) = self.spec.discontinuity_at_ms {
            if !self.discontinuity_sent && next >= at * 1000 {
                self.discontinuity_sent = true;
                return Ok(Some(DemuxEvent::Discontinuity));
            }
        }

        if video == Some(next) {
            let frame_duration = self.spec.frame_duration();
            let packet = Packet {
                kind: Some(PacketKind::Video),
                track: 0,
                pts: next,
                duration: frame_duration,
                data: self.video_index.to_le_bytes().to_vec(),
            };
            self.video_index += 1;
            self.next_video += frame_duration;
            return Ok(Some(DemuxEvent::Packet(packet)));
        }

        for track in 1..=self.spec.tracks as i32 {
            self.pending.push_back(Packet {
                kind: Some(PacketKind::Audio),
                track,
                pts: next,
                duration: AUDIO_PACKET_US.min(duration - next),
                data: self.audio_index.to_le_bytes().to_vec(),
            });
        }
        self.audio_index += 1;
        self.next_audio += AUDIO_PACKET_US;
        Ok(self.pending.pop_front().map(DemuxEvent::Packet))
    }

    fn seek(&mut self, pos_us: i64) -> Result<()> {
        let pos = pos_us.clamp(0, self.info.duration);
        let frame_duration = self.spec.frame_duration();
        self.next_video = (pos / frame_duration) * frame_duration;
        self.next_audio = (pos / AUDIO_PACKET_US) * AUDIO_PACKET_US;
        self.video_index = (self.next_video / frame_duration) as u64;
        self.audio_index = (self.next_audio / AUDIO_PACKET_US) as u64;
        self.pending.clear();
        debug!("{} 合成数据 seek 到 {}us（视频 {}us，音频 {}us）", log_ctx(), pos, self.next_video, self.next_audio);
        Ok(())
    }

    fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    fn description(&self) -> String {
        format!(
            "SyntheticDemuxer({}ms, audio={}, video={})",
            self.spec.duration_ms, self.spec.audio, self.spec.video
        )
    }
}

/// 生成 440Hz 正弦波
pub struct SyntheticAudioDecoder {
    sample_rate: u32,
    channels: u16,
    decoded: u64,
    phase: f64,
    fail_at: Option<u64>,
}

impl AudioDecoder for SyntheticAudioDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<AudioFrame>> {
        self.decoded += 1;
        if self.fail_at == Some(self.decoded) {
            return Err(PlayerError::DecodeError(format!("第 {} 个音频包解码失败（注入的错误）", self.decoded)));
        }
        let frames = (self.sample_rate as i64 * packet.duration / 1_000_000).max(0) as usize;
        let step = 2.0 * std::f64::consts::PI * 440.0 / self.sample_rate as f64;
        let mut data = Vec::with_capacity(frames * self.channels as usize);
        for _ in 0..frames {
            let sample = (self.phase.sin() * 0.2) as f32;
            self.phase = (self.phase + step) % (2.0 * std::f64::consts::PI);
            data.extend(std::iter::repeat(sample).take(self.channels as usize));
        }
        Ok(vec![AudioFrame { pts: packet.pts, sample_rate: self.sample_rate, channels: self.channels, data }])
    }

    fn flush(&mut self) {
        self.phase = 0.0;
    }
}

/// 生成纯色 RGBA 帧，亮度随帧序号变化
pub struct SyntheticVideoDecoder {
    pool: Arc<Pool<VideoFrame>>,
    width: u32,
    height: u32,
    decoded: u64,
    fail_at: Option<u64>,
}

impl VideoDecoder for SyntheticVideoDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>> {
        self.decoded += 1;
        if self.fail_at == Some(self.decoded) {
            return Err(PlayerError::DecodeError(format!("第 {} 个视频包解码失败（注入的错误）", self.decoded)));
        }
        let index = packet
            .data
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0);
        let shade = (index % 256) as u8;

        let mut frame = self.pool.get();
        frame.pts = packet.pts;
        frame.duration = packet.duration;
        frame.width = self.width;
        frame.height = self.height;
        frame.format = PixelFormat::RGBA;
        frame.data.clear();
        let pixels = self.width as usize * self.height as usize;
        frame.data.reserve(pixels * 4);
        for _ in 0..pixels {
            frame.data.extend_from_slice(&[shade, shade, shade, 255]);
        }
        Ok(vec![frame])
    }

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        let spec = SyntheticSpec::parse("synthetic:duration=1000,fps=10,audio=0,chapters=300,title=demo").unwrap();
        assert_eq!(spec.duration_ms, 1000);
        assert_eq!(spec.fps, 10);
        assert!(!spec.audio);
        assert!(spec.video);
        let info = spec.media_info();
        assert_eq!(info.chapters, vec![0, 300_000, 600_000, 900_000]);
        assert_eq!(info.title.as_deref(), Some("demo"));
        assert!(info.audio_tracks.is_empty());

        assert!(SyntheticSpec::parse("file.mkv").is_err());
        assert!(SyntheticSpec::parse("synthetic:bogus=1").is_err());
        assert!(SyntheticSpec::parse("synthetic:fps=0").is_err());
        assert!(SyntheticSpec::parse("synthetic:").is_ok());
    }

    #[test]
    fn test_packets_interleaved_by_pts() {
        let mut demuxer = SyntheticDemuxer::new(SyntheticSpec::parse("synthetic:duration=200,fps=25,tracks=2").unwrap());
        let mut last = i64::MIN;
        let (mut video, mut audio) = (0, 0);
        while let Some(ev) = demuxer.read_packet().unwrap() {
            let DemuxEvent::Packet(p) = ev else { panic!("unexpected discontinuity") };
            assert!(p.pts >= last);
            last = p.pts;
            match p.kind {
                Some(PacketKind::Video) => video += 1,
                Some(PacketKind::Audio) => audio += 1,
                None => unreachable!(),
            }
        }
        assert_eq!(video, 5);
        // 两条音轨，每条 10 个 20ms 包
        assert_eq!(audio, 20);
    }

    #[test]
    fn test_seek_and_discontinuity() {
        let mut demuxer =
            SyntheticDemuxer::new(SyntheticSpec::parse("synthetic:duration=1000,audio=0,discontinuity_at=100").unwrap());
        demuxer.seek(90_000).unwrap();
        let Some(DemuxEvent::Packet(p)) = demuxer.read_packet().unwrap() else { panic!("expected packet") };
        assert_eq!(p.pts, 80_000);
        assert!(matches!(demuxer.read_packet().unwrap(), Some(DemuxEvent::Discontinuity)));
        let Some(DemuxEvent::Packet(p)) = demuxer.read_packet().unwrap() else { panic!("expected packet") };
        assert_eq!(p.pts, 120_000);
    }

    #[test]
    fn test_decoders_with_injected_fault() {
        let pool = Arc::new(Pool::new(4, VideoFrame::default));
        let backend = SyntheticBackend::new();
        let path = "synthetic:fail_video_at=2";
        let provider = backend.open_stream(path).unwrap();
        let demuxer = backend.open_demuxer(path, &provider).unwrap();
        let info = demuxer.media_info().clone();

        let mut vdec = backend.video_decoder(&info, pool.clone()).unwrap();
        let packet = Packet { kind: Some(PacketKind::Video), track: 0, pts: 0, duration: 40_000, data: 3u64.to_le_bytes().to_vec() };
        let frames = vdec.decode(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), 16 * 9 * 4);
        assert_eq!(&frames[0].data[..4], &[3, 3, 3, 255]);
        assert!(matches!(vdec.decode(&packet), Err(PlayerError::DecodeError(_))));

        let mut adec = backend.audio_decoder(&info, 1).unwrap();
        let packet = Packet { kind: Some(PacketKind::Audio), track: 1, pts: 0, duration: 20_000, data: Vec::new() };
        let frames = adec.decode(&packet).unwrap();
        assert_eq!(frames[0].frames(), 960);
        assert!(backend.audio_decoder(&info, 7).is_err());

        assert_eq!(provider.buffer_state(), (0, 0));
        backend.set_stream_level(30, 100);
        backend.set_blocking(true);
        assert_eq!(provider.buffer_state(), (30, 100));
        assert!(provider.is_blocking());

        provider.close();
        provider.close();
        assert_eq!(
            backend.drain_events(),
            vec![
                SyntheticEvent::StreamOpened(path.to_string()),
                SyntheticEvent::DemuxerOpened,
                SyntheticEvent::VideoDecoderCreated,
                SyntheticEvent::AudioDecoderCreated(1),
                SyntheticEvent::StreamClosed,
            ]
        );
        assert!(matches!(backend.open_stream("synthetic:fail_open=1"), Err(PlayerError::OpenError(_))));
    }
}
