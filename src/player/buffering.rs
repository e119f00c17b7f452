use crate::core::log_ctx;
use log::info;

/// 单个缓冲的水位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferLevel {
    pub count: usize,
    pub capacity: usize,
}

impl BufferLevel {
    pub fn new(count: usize, capacity: usize) -> Self {
        Self { count, capacity }
    }

    /// 容量为 0 的缓冲不参与判断
    pub fn percent(&self) -> Option<u32> {
        if self.capacity == 0 {
            None
        } else {
            Some(((self.count.min(self.capacity) * 100) / self.capacity) as u32)
        }
    }
}

/// 被监控的三个缓冲：数据源、音频输出环形缓冲、解码后的视频帧队列
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferLevels {
    pub stream: BufferLevel,
    pub audio: Option<BufferLevel>,
    pub video: Option<BufferLevel>,
    /// 数据源已经读完，之后不会再有数据进来
    pub end_of_stream: bool,
}

impl BufferLevels {
    fn monitored(&self) -> impl Iterator<Item = u32> + '_ {
        [Some(self.stream), self.audio, self.video]
            .into_iter()
            .flatten()
            .filter_map(|level| level.percent())
    }

    /// 缓冲进度：最空的那个缓冲的百分比
    pub fn percent(&self) -> u32 {
        if self.end_of_stream {
            return 100;
        }
        self.monitored().min().unwrap_or(100)
    }

    pub fn any_below(&self, watermark: u32) -> bool {
        !self.end_of_stream && self.monitored().any(|p| p < watermark)
    }

    pub fn all_above(&self, watermark: u32) -> bool {
        self.end_of_stream || self.monitored().all(|p| p >= watermark)
    }
}

/// 欠载判断（带迟滞）
///
/// 任一缓冲低于低水位进入缓冲状态；所有缓冲同时达到高水位才退出，避免来回切换。
#[derive(Debug, Clone)]
pub struct UnderrunMonitor {
    low_watermark: u32,
    high_watermark: u32,
    is_buffering: bool,
    last_percent: u32,
}

impl UnderrunMonitor {
    pub fn new(low_watermark: u32, high_watermark: u32) -> Self {
        Self {
            low_watermark,
            high_watermark: high_watermark.max(low_watermark),
            is_buffering: false,
            last_percent: 0,
        }
    }

    /// 更新水位；返回 Some(true) 表示开始缓冲，Some(false) 表示缓冲完成
    pub fn update(&mut self, levels: &BufferLevels) -> Option<bool> {
        self.last_percent = levels.percent();
        if self.is_buffering {
            if levels.all_above(self.high_watermark) {
                info!("{} ✅ 缓冲完成（{}%）", log_ctx(), self.last_percent);
                self.is_buffering = false;
                return Some(false);
            }
        } else if levels.any_below(self.low_watermark) {
            info!("{} 🔄 开始缓冲（当前 {}% / 低水位 {}%）", log_ctx(), self.last_percent, self.low_watermark);
            self.is_buffering = true;
            return Some(true);
        }
        None
    }

    /// 不看水位直接进入缓冲状态（启动、seek、音频欠载）
    pub fn start_buffering(&mut self) {
        self.is_buffering = true;
    }

    /// 是否应该缓冲
    pub fn should_buffer(&self) -> bool {
        self.is_buffering
    }

    /// 缓冲进度（0 - 100）
    pub fn buffer_progress(&self) -> u32 {
        self.last_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(audio: usize, video: usize) -> BufferLevels {
        BufferLevels {
            stream: BufferLevel::new(0, 0),
            audio: Some(BufferLevel::new(audio, 100)),
            video: Some(BufferLevel::new(video, 10)),
            end_of_stream: false,
        }
    }

    #[test]
    fn test_hysteresis() {
        let mut m = UnderrunMonitor::new(20, 80);
        assert_eq!(m.update(&levels(50, 5)), None);
        assert_eq!(m.update(&levels(10, 5)), Some(true));
        assert!(m.should_buffer());
        // 一个到了高水位还不够
        assert_eq!(m.update(&levels(90, 5)), None);
        assert_eq!(m.buffer_progress(), 50);
        assert_eq!(m.update(&levels(90, 8)), Some(false));
        assert!(!m.should_buffer());
        // 回落到两个水位之间不会重新进入
        assert_eq!(m.update(&levels(30, 3)), None);
    }

    #[test]
    fn test_end_of_stream_satisfies_buffering() {
        let mut m = UnderrunMonitor::new(20, 80);
        m.start_buffering();
        let mut l = levels(0, 0);
        assert_eq!(m.update(&l), None);
        l.end_of_stream = true;
        assert_eq!(m.update(&l), Some(false));
        assert_eq!(m.buffer_progress(), 100);
    }

    #[test]
    fn test_unmonitored_buffers() {
        let l = BufferLevels::default();
        assert_eq!(l.percent(), 100);
        assert!(l.all_above(80));
        assert!(!l.any_below(20));
        assert_eq!(BufferLevel::new(15, 10).percent(), Some(100));
    }
}
