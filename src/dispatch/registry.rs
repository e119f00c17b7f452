//! 对象表
//!
//! 全局 slab 持有每个对象唯一的长期强引用；外部只拿到 `ActorRef`
//! （下标 + 代数），每次使用时到表里校验。对象销毁后下标被复用、代数加一，
//! 旧的 `ActorRef` 再解析就会失败。

use super::object::ActorCell;
use crate::core::DispatchError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// 对象句柄
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorRef {
    index: u32,
    generation: u32,
}

impl ActorRef {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({}v{})", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    cell: Option<Arc<ActorCell>>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

impl Registry {
    fn insert_with<F>(&mut self, make: F) -> Result<(ActorRef, Arc<ActorCell>), DispatchError>
    where
        F: FnOnce(ActorRef) -> Arc<ActorCell>,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.try_reserve(1).map_err(|_| DispatchError::OutOfMemory)?;
                self.slots.push(Slot { generation: 0, cell: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ActorRef { index, generation: slot.generation };
        let cell = make(id);
        slot.cell = Some(cell.clone());
        self.live += 1;
        Ok((id, cell))
    }

    fn resolve(&self, id: ActorRef) -> Option<Arc<ActorCell>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.cell.clone()
    }

    fn remove(&mut self, id: ActorRef) -> Option<Arc<ActorCell>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(cell)
    }
}

/// 注册新对象，`make` 拿到分配好的句柄后构造对象
pub(crate) fn insert_with<F>(make: F) -> Result<(ActorRef, Arc<ActorCell>), DispatchError>
where
    F: FnOnce(ActorRef) -> Arc<ActorCell>,
{
    REGISTRY.lock().insert_with(make)
}

pub(crate) fn resolve(id: ActorRef) -> Option<Arc<ActorCell>> {
    REGISTRY.lock().resolve(id)
}

/// 从表中移除；返回的强引用在锁外释放
pub(crate) fn remove(id: ActorRef) -> Option<Arc<ActorCell>> {
    let cell = REGISTRY.lock().remove(id);
    cell
}

/// 当前存活的对象数量
pub fn live_actors() -> usize {
    REGISTRY.lock().live
}
