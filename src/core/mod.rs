// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod error;
pub mod config;

pub use types::*;
pub use clock::*;
pub use error::*;
pub use config::{PlayerConfig, RuntimeConfig};

use std::process;
use std::thread;

/// 日志前缀：进程号 + 线程号
pub fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
