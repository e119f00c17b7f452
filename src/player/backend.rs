use crate::core::{log_ctx, AudioFrame, MediaInfo, Packet, PlayerConfig, Rect, Result, SeekFlags, VideoFrame};
use crate::dispatch::Pool;
use crate::player::audio_output::{AudioSink, SoftwareAudioSink};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 流提供者（DVD 导航、P2P 流、普通文件……）
///
/// 播放器只通过这个接口控制数据源；读包由 [`Demuxer`] 完成。
pub trait StreamProvider: Send + Sync {
    /// 开始取流
    fn play(&self, skip_to_menu: bool) -> Result<()>;

    /// 通知数据源即将跳转（位置单位：微秒）
    fn seek(&self, flags: SeekFlags, pos: i64) -> Result<()>;

    /// 停止取流，唤醒所有阻塞在数据源上的读者
    fn close(&self);

    /// 释放资源；在流水线全部退出之后调用
    fn destroy(&self);

    /// 数据源自己的缓冲 (count, capacity)；capacity 为 0 表示没有缓冲
    fn buffer_state(&self) -> (usize, usize) {
        (0, 0)
    }

    /// 欠载是预期内的，由数据源自己处理；为 true 时播放器不进入缓冲
    fn underrun_expected(&self) -> bool {
        false
    }

    fn can_pause(&self) -> bool {
        true
    }

    /// 数据源此刻正故意卡住读取线程（等待菜单操作、等待数据片段）
    ///
    /// 这期间水位下降不算欠载。
    fn is_blocking(&self) -> bool {
        false
    }

    /// 菜单高亮区域
    fn highlight(&self) -> Option<Rect> {
        None
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 解封装事件
#[derive(Debug)]
pub enum DemuxEvent {
    Packet(Packet),
    /// 时间戳不连续，需要 flush
    Discontinuity,
}

/// 解封装器
///
/// 返回：
/// - Ok(Some(event)): 成功读取一个包或事件
/// - Ok(None): 到达文件末尾
/// - Err(e): 读取错误
pub trait Demuxer: Send {
    fn read_packet(&mut self) -> Result<Option<DemuxEvent>>;

    /// Seek 到指定位置（微秒）
    fn seek(&mut self, pos_us: i64) -> Result<()>;

    fn media_info(&self) -> &MediaInfo;

    fn description(&self) -> String;
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<AudioFrame>>;

    /// 丢弃解码器内部缓存的数据
    fn flush(&mut self);
}

pub trait VideoDecoder: Send {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>>;

    fn flush(&mut self);
}

/// 媒体后端：把路径变成各阶段需要的对象
pub trait MediaBackend: Send + Sync {
    fn open_stream(&self, path: &str) -> Result<Arc<dyn StreamProvider>>;

    fn open_demuxer(&self, path: &str, provider: &Arc<dyn StreamProvider>) -> Result<Box<dyn Demuxer>>;

    fn audio_decoder(&self, info: &MediaInfo, track: i32) -> Result<Box<dyn AudioDecoder>>;

    /// 视频帧从 `frames` 池中取，输出之后归还
    fn video_decoder(&self, info: &MediaInfo, frames: Arc<Pool<VideoFrame>>) -> Result<Box<dyn VideoDecoder>>;

    /// 默认使用软件音频输出；媒体没有给出格式时用配置里的格式
    fn audio_sink(&self, info: &MediaInfo, config: &PlayerConfig) -> Result<Arc<dyn AudioSink>> {
        let sample_rate = if info.sample_rate > 0 { info.sample_rate } else { config.audio_sample_rate };
        let channels = if info.channels > 0 { info.channels } else { config.audio_channels };
        let sink = SoftwareAudioSink::new(sample_rate, channels, config.audio_buffer_ms)?;
        Ok(Arc::new(sink))
    }
}

/// 位置由解封装器自己维护的普通数据源
pub struct PlainStreamProvider {
    path: String,
    playing: AtomicBool,
    closed: AtomicBool,
    last_seek: Mutex<Option<i64>>,
}

impl PlainStreamProvider {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_seek: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// 最近一次 seek 的目标位置
    pub fn last_seek(&self) -> Option<i64> {
        *self.last_seek.lock()
    }
}

impl StreamProvider for PlainStreamProvider {
    fn play(&self, _skip_to_menu: bool) -> Result<()> {
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn seek(&self, flags: SeekFlags, pos: i64) -> Result<()> {
        debug!("{} {} seek {:?} -> {}us", log_ctx(), self.path, flags, pos);
        *self.last_seek.lock() = Some(pos);
        Ok(())
    }

    fn close(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn destroy(&self) {
        debug!("{} 释放数据源 {}", log_ctx(), self.path);
    }

    fn description(&self) -> String {
        format!("PlainStream({})", self.path)
    }
}
