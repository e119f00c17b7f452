use super::object::ActorCell;
use super::registry::ActorRef;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// 消息负载：不透明、可跨线程共享
pub type Payload = Arc<dyn Any + Send + Sync>;

/// 消息类型
///
/// `Destroy` 和 `Cleanup` 是保留的生命周期消息，会先经过对象的包装处理器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Input,
    Timer,
    Exception,
    Ui,
    System,
    Delegate,
    Player,
    Volume,
    Selected,
    Dismissed,
    Destroy,
    Cleanup,
    StreamReady,
    Quit,
    User(u16),
}

impl MessageType {
    /// 线上编号
    pub fn id(&self) -> u32 {
        match self {
            MessageType::Input => 0x01,
            MessageType::Timer => 0x02,
            MessageType::Exception => 0x03,
            MessageType::Ui => 0x04,
            MessageType::System => 0x05,
            MessageType::Delegate => 0x06,
            MessageType::Player => 0x07,
            MessageType::Volume => 0x08,
            MessageType::Selected => 0x09,
            MessageType::Dismissed => 0x0A,
            MessageType::Quit => 0x0B,
            MessageType::Destroy => 0x0C,
            MessageType::Cleanup => 0x0D,
            MessageType::StreamReady => 0x0E,
            MessageType::User(n) => 0x100 + *n as u32,
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, MessageType::Destroy | MessageType::Cleanup)
    }
}

/// 投递方式（互斥）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastMode {
    /// 单一目标
    Unicast,
    /// 按顺序尝试，第一个返回 `Dispatch::Ok` 的目标处理后停止
    Anycast,
    /// 投递给所有目标，忽略返回值
    Multicast,
    /// 投递给目标线程上的所有对象
    Broadcast,
}

/// 处理器返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 已处理（对 DESTROY 表示同意销毁）
    Ok,
    /// 未处理 / 稍后再试
    Continue,
}

#[derive(Clone)]
pub(crate) enum Destination {
    One(Arc<ActorCell>),
    Many(Vec<Arc<ActorCell>>),
}

/// 消息
///
/// 每个目标在消息存活期间都被持有一次引用，消息投递完后释放。
#[derive(Clone)]
pub struct Message {
    kind: MessageType,
    cast: CastMode,
    payload: Option<Payload>,
    pub(crate) dest: Destination,
}

impl Message {
    pub(crate) fn new(kind: MessageType, cast: CastMode, payload: Option<Payload>, dest: Destination) -> Self {
        Self { kind, cast, payload, dest }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn cast(&self) -> CastMode {
        self.cast
    }

    /// 按具体类型读取负载
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref::<T>()
    }

    pub fn raw_payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub(crate) fn targets(&self) -> &[Arc<ActorCell>] {
        match &self.dest {
            Destination::One(cell) => std::slice::from_ref(cell),
            Destination::Many(cells) => cells,
        }
    }

    /// 目标列表
    pub fn destinations(&self) -> Vec<ActorRef> {
        self.targets().iter().map(|c| c.id()).collect()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("cast", &self.cast)
            .field("has_payload", &self.payload.is_some())
            .field("dest", &self.destinations())
            .finish()
    }
}

/// 消息处理器
pub trait Handler: Send + 'static {
    fn handle(&mut self, this: ActorRef, msg: &Message) -> Dispatch;
}

impl<F> Handler for F
where
    F: FnMut(ActorRef, &Message) -> Dispatch + Send + 'static,
{
    fn handle(&mut self, this: ActorRef, msg: &Message) -> Dispatch {
        self(this, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_ids() {
        assert_eq!(MessageType::Delegate.id(), 0x06);
        assert_eq!(MessageType::Destroy.id(), 0x0C);
        assert_eq!(MessageType::Cleanup.id(), 0x0D);
        assert_eq!(MessageType::StreamReady.id(), 0x0E);
        assert_eq!(MessageType::User(1).id(), 0x101);
        assert!(MessageType::Cleanup.is_lifecycle());
        assert!(!MessageType::Player.is_lifecycle());
    }
}
