use crate::core::{log_ctx, AspectRatio, PixelFormat, PlayerError, Rect, Result, VideoFrame};
use crate::dispatch::{AvThread, Delegate, ThreadPriority};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

/// 一次呈现调用：参数是帧，结果把帧交还给调用方（归还帧池）
pub type PresentCall = Delegate<VideoFrame, (VideoFrame, Result<()>)>;

/// 视频呈现接口
///
/// 画面属于某个线程，`draw` 只能在那个线程上执行；其他线程通过
/// `delegate_to_owner` 把调用交过去。
pub trait VideoPresenter: Send + Sync {
    fn delegate_to_owner(&self, call: &Arc<PresentCall>) -> Result<()>;

    fn draw(&self, frame: &VideoFrame) -> Result<()>;

    fn set_aspect_ratio(&self, ratio: AspectRatio);
}

/// 渲染统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_rendered: u64,
    pub last_pts: Option<i64>,
    /// 最近一帧在画面上的位置
    pub last_rect: Rect,
}

struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    aspect_ratio: Option<AspectRatio>,
    stats: RenderStats,
}

/// 按宽高比在画面内居中（letterbox / pillarbox）
pub fn fit_rect(surface_w: u32, surface_h: u32, ratio: AspectRatio) -> Rect {
    if surface_w == 0 || surface_h == 0 || ratio.num == 0 || ratio.den == 0 {
        return Rect { x: 0, y: 0, w: surface_w, h: surface_h };
    }
    let video_aspect = ratio.num as f64 / ratio.den as f64;
    let rect_aspect = surface_w as f64 / surface_h as f64;
    let (w, h) = if video_aspect > rect_aspect {
        // 视频更宽，以宽度为准
        (surface_w, ((surface_w as f64 / video_aspect).round() as u32).max(1))
    } else {
        // 视频更高，以高度为准
        (((surface_h as f64 * video_aspect).round() as u32).max(1), surface_h)
    };
    Rect {
        x: ((surface_w - w) / 2) as i32,
        y: ((surface_h - h) / 2) as i32,
        w,
        h,
    }
}

/// 画面由一个专用派发线程拥有的呈现器
pub struct ThreadPresenter {
    thread: AvThread,
    surface: Mutex<Surface>,
}

impl ThreadPresenter {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let thread = AvThread::spawn("video-surface", ThreadPriority::Normal)?;
        info!("{} 🎨 初始化画面 {}x{}", log_ctx(), width, height);
        Ok(Self {
            thread,
            surface: Mutex::new(Surface {
                width,
                height,
                pixels: vec![0; width as usize * height as usize * 4],
                aspect_ratio: None,
                stats: RenderStats::default(),
            }),
        })
    }

    pub fn stats(&self) -> RenderStats {
        self.surface.lock().stats
    }

    pub fn frames_rendered(&self) -> u64 {
        self.surface.lock().stats.frames_rendered
    }

    /// 读取画面上一个像素（RGBA）
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let s = self.surface.lock();
        if x >= s.width || y >= s.height {
            return None;
        }
        let i = (y as usize * s.width as usize + x as usize) * 4;
        Some([s.pixels[i], s.pixels[i + 1], s.pixels[i + 2], s.pixels[i + 3]])
    }

    /// 清理资源
    pub fn cleanup(&self) {
        let mut s = self.surface.lock();
        s.pixels.iter_mut().for_each(|p| *p = 0);
        s.stats = RenderStats::default();
        info!("{} 🧹 清理画面", log_ctx());
    }
}

impl VideoPresenter for ThreadPresenter {
    fn delegate_to_owner(&self, call: &Arc<PresentCall>) -> Result<()> {
        self.thread.delegate_call(call)?;
        Ok(())
    }

    fn draw(&self, frame: &VideoFrame) -> Result<()> {
        if !self.thread.is_current() {
            return Err(PlayerError::VideoError("draw 必须在画面线程上执行".to_string()));
        }
        if frame.format != PixelFormat::RGBA {
            return Err(PlayerError::VideoError(format!("不支持的像素格式 {:?}", frame.format)));
        }
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.width == 0 || frame.height == 0 || frame.data.len() < expected {
            return Err(PlayerError::VideoError(format!(
                "帧数据不完整: {}x{}，{} 字节",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }

        let mut s = self.surface.lock();
        let ratio = s.aspect_ratio.unwrap_or(AspectRatio { num: frame.width, den: frame.height });
        let rect = fit_rect(s.width, s.height, ratio);

        // 最近邻缩放
        let sw = s.width as usize;
        for dy in 0..rect.h as usize {
            let sy = dy * frame.height as usize / rect.h as usize;
            for dx in 0..rect.w as usize {
                let sx = dx * frame.width as usize / rect.w as usize;
                let src = (sy * frame.width as usize + sx) * 4;
                let dst = ((rect.y as usize + dy) * sw + rect.x as usize + dx) * 4;
                s.pixels[dst..dst + 4].copy_from_slice(&frame.data[src..src + 4]);
            }
        }

        s.stats.frames_rendered += 1;
        s.stats.last_pts = Some(frame.pts);
        s.stats.last_rect = rect;
        debug!("{} 🖼️ 呈现 pts={}us -> {:?}", log_ctx(), frame.pts, rect);
        Ok(())
    }

    fn set_aspect_ratio(&self, ratio: AspectRatio) {
        let mut s = self.surface.lock();
        if s.aspect_ratio != Some(ratio) {
            info!("{} 画面宽高比 {}:{}", log_ctx(), ratio.num, ratio.den);
            s.aspect_ratio = Some(ratio);
            s.pixels.iter_mut().for_each(|p| *p = 0);
        }
    }
}
