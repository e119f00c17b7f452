use thiserror::Error;

/// 邮箱（有界阻塞队列）操作错误
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// 队列满（put）或队列空 / 被唤醒 / 超时（get、peek）
    #[error("队列暂不可用 (would block)")]
    WouldBlock,

    /// 队列已关闭且没有剩余元素
    #[error("队列已关闭 (shutdown)")]
    Shutdown,

    #[error("队列内存不足")]
    OutOfMemory,
}

/// put 失败时把元素交还给调用者，方便重试而不必重新分配
#[derive(Debug)]
pub struct PutError<T> {
    pub kind: QueueError,
    pub item: T,
}

impl<T> PutError<T> {
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> std::fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl<T: std::fmt::Debug> std::error::Error for PutError<T> {}

impl<T> From<PutError<T>> for QueueError {
    fn from(e: PutError<T>) -> Self {
        e.kind
    }
}

/// 消息派发层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("内存不足")]
    OutOfMemory,

    #[error("目标队列已满")]
    WouldBlock,

    #[error("目标队列已关闭")]
    Shutdown,

    #[error("当前线程没有派发队列")]
    NoQueue,

    #[error("当前线程的派发队列已经创建")]
    AlreadyInitialized,

    #[error("非法的投递方式: {0}")]
    InvalidCast(&'static str),

    #[error("对象已销毁")]
    Destroyed,

    #[error("委托调用未执行就被取消")]
    Cancelled,

    #[error("线程启动失败: {0}")]
    Spawn(String),
}

impl From<QueueError> for DispatchError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::WouldBlock => DispatchError::WouldBlock,
            QueueError::Shutdown => DispatchError::Shutdown,
            QueueError::OutOfMemory => DispatchError::OutOfMemory,
        }
    }
}

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("派发错误: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(#[from] serde_json::Error),

    #[error("无法打开媒体: {0}")]
    OpenError(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("视频输出错误: {0}")]
    VideoError(String),

    #[error("播放器忙：播放/停止流程正在进行")]
    Busy,

    #[error("当前状态不允许该操作: {0}")]
    InvalidState(&'static str),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_error_maps_to_dispatch_error() {
        assert_eq!(DispatchError::from(QueueError::Shutdown), DispatchError::Shutdown);
        assert_eq!(DispatchError::from(QueueError::WouldBlock), DispatchError::WouldBlock);
        assert_eq!(DispatchError::from(QueueError::OutOfMemory), DispatchError::OutOfMemory);
    }

    #[test]
    fn put_error_returns_item() {
        let e = PutError { kind: QueueError::WouldBlock, item: 7u32 };
        assert_eq!(e.to_string(), QueueError::WouldBlock.to_string());
        assert_eq!(e.into_inner(), 7);
    }
}
