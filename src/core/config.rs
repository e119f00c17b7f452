use crate::core::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 指向 JSON 配置文件的环境变量
pub const CONFIG_ENV: &str = "MYY_AVKIT_CONFIG";

/// 派发运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 通用工作线程数量
    pub workqueue_threads: usize,
    /// 队列满时 put 等待一次唤醒的最长时间（毫秒）
    pub put_wait_ms: u64,
    /// DESTROY 被拒绝后重发的间隔（毫秒）
    pub destroy_retry_ms: u64,
    /// DESTROY 最多重发次数，超过后强制进入 CLEANUP
    pub destroy_max_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workqueue_threads: 3,
            put_wait_ms: 100,
            destroy_retry_ms: 100,
            destroy_max_retries: 600,
        }
    }
}

impl RuntimeConfig {
    pub fn put_wait(&self) -> Duration {
        Duration::from_millis(self.put_wait_ms)
    }

    pub fn destroy_retry(&self) -> Duration {
        Duration::from_millis(self.destroy_retry_ms)
    }
}

/// 播放器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub runtime: RuntimeConfig,

    // 队列容量（背压）
    pub video_packet_capacity: usize,
    pub audio_packet_capacity: usize,
    pub video_frame_capacity: usize,

    /// 欠载低水位（百分比）：任一缓冲低于它就进入缓冲状态
    pub low_watermark: u32,
    /// 欠载高水位（百分比）：全部缓冲同时高于它才退出缓冲状态
    pub high_watermark: u32,
    /// 缓冲期间重新检查的周期（毫秒）
    pub underrun_check_ms: u64,

    /// flush 时等待各阶段清空的最长时间（毫秒）
    pub flush_timeout_ms: u64,
    /// halt 检查点时唤醒队列的间隔（毫秒）
    pub checkpoint_wake_ms: u64,

    /// 解码 / 输出线程使用较高优先级
    pub elevated_priority: bool,

    /// 视频帧比主时钟晚多少（微秒）就丢弃
    pub late_frame_threshold_us: i64,

    // 软件音频输出
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// 音频环形缓冲容量（毫秒）
    pub audio_buffer_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            video_packet_capacity: 200,
            audio_packet_capacity: 150,
            video_frame_capacity: 8,
            low_watermark: 20,
            high_watermark: 80,
            underrun_check_ms: 100,
            flush_timeout_ms: 5000,
            checkpoint_wake_ms: 10,
            elevated_priority: false,
            late_frame_threshold_us: 100_000,
            audio_sample_rate: 48000,
            audio_channels: 2,
            audio_buffer_ms: 500,
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文件加载，缺省字段使用默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: PlayerConfig = serde_json::from_str(&text)?;
        config.validate();
        Ok(config)
    }

    /// 读取 `MYY_AVKIT_CONFIG` 指向的文件；未设置或解析失败时使用默认值
    pub fn from_env() -> Self {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => match Self::from_json_file(&path) {
                Ok(config) => {
                    info!("📄 已加载配置: {}", path);
                    config
                }
                Err(e) => {
                    warn!("⚠️  加载配置 {} 失败: {}，使用默认配置", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    fn validate(&self) {
        if self.low_watermark > self.high_watermark {
            warn!(
                "⚠️  低水位 {}% 高于高水位 {}%，缓冲状态可能来回切换",
                self.low_watermark, self.high_watermark
            );
        }
    }

    pub fn underrun_check(&self) -> Duration {
        Duration::from_millis(self.underrun_check_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn checkpoint_wake(&self) -> Duration {
        Duration::from_millis(self.checkpoint_wake_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: PlayerConfig =
            serde_json::from_str(r#"{ "video_frame_capacity": 4, "runtime": { "workqueue_threads": 2 } }"#)
                .unwrap();
        assert_eq!(config.video_frame_capacity, 4);
        assert_eq!(config.runtime.workqueue_threads, 2);
        assert_eq!(config.runtime.put_wait_ms, RuntimeConfig::default().put_wait_ms);
        assert_eq!(config.high_watermark, PlayerConfig::default().high_watermark);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = PlayerConfig::from_json_file("/nonexistent/myy_avkit.json").unwrap_err();
        assert!(matches!(err, crate::core::PlayerError::IoError(_)));
    }
}
