//! myy_avkit：消息派发运行时 + 播放流水线编排器
//!
//! - [`dispatch`]：线程绑定的派发队列、对象、委托、检查点、定时器和工作线程池
//! - [`player`]：数据源 -> 解码 -> 输出的多线程播放流水线，以及控制它的播放器

pub mod core;
pub mod dispatch;
pub mod player;

pub use crate::core::{PlayerConfig, PlayerError, PlayerStatus, PlayState, Result, RuntimeConfig, SeekFlags, TrackKind};
pub use crate::player::{MediaBackend, Player, PlayerStats, VideoPresenter};
