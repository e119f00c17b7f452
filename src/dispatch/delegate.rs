//! 跨线程同步调用
//!
//! 委托把一个函数和它的参数包装起来，作为 DELEGATE 消息发给目标线程执行；
//! 调用方可以 `wait()` 取回结果。可回收的委托在 `wait()` 之后重置，
//! 通过 `rearm()` 填入新参数再次使用，避免热路径上每次分配。

use super::message::{Message, MessageType};
use super::registry::ActorRef;
use crate::core::DispatchError;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DelegateFlags: u32 {
        /// wait() 之后重置，可以再次使用
        const RECYCLABLE = 0x1;
    }
}

struct DelegateState<A, R> {
    arg: Option<A>,
    result: Option<Result<R, DispatchError>>,
    armed: bool,
    finished: bool,
    detached: bool,
}

pub struct Delegate<A, R> {
    func: Mutex<Box<dyn FnMut(A) -> R + Send>>,
    state: Mutex<DelegateState<A, R>>,
    cond: Condvar,
    flags: DelegateFlags,
}

impl<A: Send + 'static, R: Send + 'static> Delegate<A, R> {
    pub fn new<F>(func: F, arg: A, flags: DelegateFlags) -> Arc<Self>
    where
        F: FnMut(A) -> R + Send + 'static,
    {
        Arc::new(Self {
            func: Mutex::new(Box::new(func)),
            state: Mutex::new(DelegateState {
                arg: Some(arg),
                result: None,
                armed: true,
                finished: false,
                detached: false,
            }),
            cond: Condvar::new(),
            flags,
        })
    }

    /// 空闲的可回收委托，第一次使用前需要 `rearm()`
    pub fn recyclable<F>(func: F) -> Arc<Self>
    where
        F: FnMut(A) -> R + Send + 'static,
    {
        Arc::new(Self {
            func: Mutex::new(Box::new(func)),
            state: Mutex::new(DelegateState {
                arg: None,
                result: None,
                armed: false,
                finished: false,
                detached: false,
            }),
            cond: Condvar::new(),
            flags: DelegateFlags::RECYCLABLE,
        })
    }

    /// 在目标线程上执行，只能执行一次
    pub fn execute(&self) {
        self.execute_with(&mut || {});
    }

    /// 执行，`before_publish` 在函数返回之后、等待方被唤醒之前调用
    pub fn execute_with(&self, before_publish: &mut dyn FnMut()) {
        let arg = {
            let mut st = self.state.lock();
            assert!(st.armed && !st.finished, "委托重复执行");
            match st.arg.take() {
                Some(arg) => arg,
                None => panic!("委托没有参数"),
            }
        };
        let result = {
            let mut func = self.func.lock();
            (*func)(arg)
        };
        before_publish();
        self.finish(Ok(result));
    }

    /// 委托消息被丢弃、没有执行
    pub fn cancel(&self) {
        let mut st = self.state.lock();
        if st.finished || !st.armed {
            return;
        }
        st.arg = None;
        drop(st);
        self.finish(Err(DispatchError::Cancelled));
    }

    fn finish(&self, result: Result<R, DispatchError>) {
        let mut st = self.state.lock();
        st.result = Some(result);
        st.finished = true;
        let detached = st.detached;
        drop(st);
        if !detached {
            self.cond.notify_all();
        }
    }

    fn take_result(&self, st: &mut DelegateState<A, R>) -> Result<R, DispatchError> {
        let result = match st.result.take() {
            Some(r) => r,
            None => panic!("委托结果已被取走"),
        };
        if self.flags.contains(DelegateFlags::RECYCLABLE) {
            st.armed = false;
            st.finished = false;
        }
        result
    }

    /// 阻塞直到执行完成并取走结果
    pub fn wait(&self) -> Result<R, DispatchError> {
        let mut st = self.state.lock();
        assert!(!st.detached, "等待已分离的委托");
        while !st.finished {
            self.cond.wait(&mut st);
        }
        self.take_result(&mut st)
    }

    /// 带超时的 wait；超时返回 `WouldBlock`，委托仍然有效
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, DispatchError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        assert!(!st.detached, "等待已分离的委托");
        while !st.finished {
            if self.cond.wait_until(&mut st, deadline).timed_out() && !st.finished {
                return Err(DispatchError::WouldBlock);
            }
        }
        self.take_result(&mut st)
    }

    /// 为可回收委托填入下一次调用的参数
    pub fn rearm(&self, arg: A) {
        assert!(self.flags.contains(DelegateFlags::RECYCLABLE), "委托不可回收");
        let mut st = self.state.lock();
        assert!(!st.armed, "委托仍在使用中");
        st.arg = Some(arg);
        st.result = None;
        st.armed = true;
        st.finished = false;
    }

    /// 不再等待结果；结果在执行后直接丢弃
    pub fn detach(&self) {
        let mut st = self.state.lock();
        st.detached = true;
        st.result = None;
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// 是否可以 rearm（可回收且上一次结果已取走）
    pub fn is_idle(&self) -> bool {
        !self.state.lock().armed
    }

    pub fn flags(&self) -> DelegateFlags {
        self.flags
    }
}

/// 类型擦除后的委托
pub(crate) trait Executable: Send + Sync {
    fn execute_with(&self, before_publish: &mut dyn FnMut());
    fn cancel(&self);
}

impl<A: Send + 'static, R: Send + 'static> Executable for Delegate<A, R> {
    fn execute_with(&self, before_publish: &mut dyn FnMut()) {
        Delegate::execute_with(self, before_publish)
    }

    fn cancel(&self) {
        Delegate::cancel(self)
    }
}

/// DELEGATE 消息的负载
///
/// 消息在执行前被丢弃（例如目标队列已关闭）时，委托被取消，等待方返回 `Cancelled`。
pub struct DelegateCall {
    inner: Mutex<Option<Arc<dyn Executable>>>,
}

impl DelegateCall {
    pub(crate) fn new<A: Send + 'static, R: Send + 'static>(delegate: Arc<Delegate<A, R>>) -> Self {
        Self { inner: Mutex::new(Some(delegate as Arc<dyn Executable>)) }
    }

    /// 执行委托；返回 false 表示已经执行过
    pub fn run(&self) -> bool {
        self.run_with(&mut || {})
    }

    /// 同 [`run`](Self::run)，结果发布前先调用 `before_publish`
    pub fn run_with(&self, before_publish: &mut dyn FnMut()) -> bool {
        let exec = self.inner.lock().take();
        match exec {
            Some(exec) => {
                exec.execute_with(before_publish);
                true
            }
            None => false,
        }
    }

    /// 如果消息是 DELEGATE，就执行它
    pub fn run_message(msg: &Message) -> bool {
        Self::run_message_with(msg, &mut || {})
    }

    pub fn run_message_with(msg: &Message, before_publish: &mut dyn FnMut()) -> bool {
        if msg.kind() != MessageType::Delegate {
            return false;
        }
        match msg.payload::<DelegateCall>() {
            Some(call) => call.run_with(before_publish),
            None => false,
        }
    }
}

impl Drop for DelegateCall {
    fn drop(&mut self) {
        if let Some(exec) = self.inner.get_mut().take() {
            exec.cancel();
        }
    }
}

/// 把委托发给目标对象执行
pub fn send_delegate<A: Send + 'static, R: Send + 'static>(
    target: ActorRef,
    delegate: &Arc<Delegate<A, R>>,
) -> Result<(), DispatchError> {
    target.post(MessageType::Delegate, DelegateCall::new(delegate.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_roundtrip_concurrent_execute() {
        for i in 0..100u64 {
            let d = Delegate::new(|x: u64| x * 3, i, DelegateFlags::empty());
            let exec = {
                let d = d.clone();
                thread::spawn(move || d.execute())
            };
            assert_eq!(d.wait().unwrap(), i * 3);
            exec.join().unwrap();
            assert!(d.is_finished());
        }
    }

    #[test]
    fn test_recyclable_reuse() {
        let d = Delegate::new(|s: String| s.len(), "abc".to_string(), DelegateFlags::RECYCLABLE);
        d.execute();
        assert_eq!(d.wait().unwrap(), 3);
        assert!(d.is_idle());
        d.rearm("hello".to_string());
        d.execute();
        assert_eq!(d.wait().unwrap(), 5);
    }

    #[test]
    fn test_recyclable_starts_idle() {
        let d = Delegate::recyclable(|x: u32| x + 1);
        assert!(d.is_idle());
        d.rearm(1);
        assert!(!d.is_idle());
        d.execute();
        assert_eq!(d.wait().unwrap(), 2);
        assert!(d.is_idle());
    }

    #[test]
    fn test_dropped_call_cancels() {
        let d = Delegate::new(|_: ()| 1, (), DelegateFlags::empty());
        let call = DelegateCall::new(d.clone());
        drop(call);
        assert_eq!(d.wait().unwrap_err(), DispatchError::Cancelled);
    }

    #[test]
    fn test_call_runs_once() {
        let d = Delegate::new(|_: ()| 42, (), DelegateFlags::empty());
        let call = DelegateCall::new(d.clone());
        assert!(call.run());
        assert!(!call.run());
        drop(call);
        assert_eq!(d.wait().unwrap(), 42);
    }

    #[test]
    fn test_hook_runs_before_waiter_wakes() {
        let done = Arc::new(Mutex::new(false));
        let d = Delegate::new(|_: ()| 7, (), DelegateFlags::empty());
        let call = DelegateCall::new(d.clone());
        let exec = {
            let done = done.clone();
            thread::spawn(move || {
                call.run_with(&mut || {
                    thread::sleep(Duration::from_millis(20));
                    *done.lock() = true;
                })
            })
        };
        assert_eq!(d.wait().unwrap(), 7);
        assert!(*done.lock());
        assert!(exec.join().unwrap());
    }

    #[test]
    fn test_wait_timeout() {
        let d = Delegate::new(|_: ()| 1, (), DelegateFlags::empty());
        assert_eq!(d.wait_timeout(Duration::from_millis(5)).unwrap_err(), DispatchError::WouldBlock);
        d.execute();
        assert_eq!(d.wait_timeout(Duration::from_millis(5)).unwrap(), 1);
    }

    #[test]
    fn test_detached_delegate_still_runs() {
        let d = Delegate::new(|_: ()| 9, (), DelegateFlags::empty());
        d.detach();
        d.execute();
        assert!(d.is_finished());
    }
}
