use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::dispatch::ActorRef;

/// 播放器对外状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Ready,
    Buffering,
    Playing,
    Paused,
}

/// 启动流程内部阶段
///
/// 一个播放周期内严格递增，完整拆除之后才回到 `Ready`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PlayState {
    Ready,
    Stream,
    AudioDec,
    VideoDec,
    AudioOut,
    VideoOut,
    Playing,
}

impl PlayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Ready => "READY",
            PlayState::Stream => "STREAM",
            PlayState::AudioDec => "AUDIODEC",
            PlayState::VideoDec => "VIDEODEC",
            PlayState::AudioOut => "AUDIOOUT",
            PlayState::VideoOut => "VIDEOOUT",
            PlayState::Playing => "PLAYING",
        }
    }
}

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    StreamParse,
    AudioDecode,
    VideoDecode,
    AudioOutput,
    VideoOutput,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::StreamParse => "stream-parse",
            Stage::AudioDecode => "audio-decode",
            Stage::VideoDecode => "video-decode",
            Stage::AudioOutput => "audio-output",
            Stage::VideoOutput => "video-output",
        }
    }
}

/// 状态通知：每次状态变化时发给所有订阅者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusData {
    pub sender: ActorRef,
    pub last_status: PlayerStatus,
    pub status: PlayerStatus,
}

bitflags! {
    /// Seek 方式
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SeekFlags: u32 {
        const ABSOLUTE = 0x01;
        const CHAPTER  = 0x02;
        const RELATIVE = 0x04;
    }
}

bitflags! {
    /// 需要 flush 的阶段
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushFlags: u32 {
        const AUDIO = 0x1;
        const SUBPX = 0x2;
        const VIDEO = 0x4;
        const ALL = Self::AUDIO.bits() | Self::SUBPX.bits() | Self::VIDEO.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Subpicture,
}

/// 画面宽高比
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectRatio {
    pub num: u32,
    pub den: u32,
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self { num: 16, den: 9 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
}

/// 解封装得到的数据包（时间单位：微秒）
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub kind: Option<PacketKind>,
    pub track: i32,
    pub pts: i64,
    pub duration: i64,
    pub data: Vec<u8>,
}

/// 视频帧数据
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: i64,           // 显示时间戳（微秒）
    pub duration: i64,      // 帧持续时间（微秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl Default for VideoFrame {
    fn default() -> Self {
        Self {
            pts: 0,
            duration: 0,
            width: 0,
            height: 0,
            format: PixelFormat::RGBA,
            data: Vec::new(),
        }
    }
}

/// 音频帧数据
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub pts: i64,           // 显示时间戳（微秒）
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,     // 交织的 f32 采样
}

impl AudioFrame {
    /// 每声道采样数
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 媒体信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: i64,          // 总时长（微秒）
    pub title: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_tracks: Vec<i32>,
    pub chapters: Vec<i64>,     // 各章节起点（微秒）
    pub sample_rate: u32,
    pub channels: u16,
    pub aspect_ratio: AspectRatio,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            duration: 0,
            title: None,
            width: 0,
            height: 0,
            fps: 0.0,
            has_audio: false,
            has_video: false,
            audio_tracks: Vec::new(),
            chapters: Vec::new(),
            sample_rate: 48000,
            channels: 2,
            aspect_ratio: AspectRatio::default(),
        }
    }
}
