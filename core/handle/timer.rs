// Copyright 2018-2025 the Deno authors. MIT license.
use super::CallbackSlot;
use super::Handle;
use super::HandleKind;
use crate::error::CallbackError;
use crate::error::UvError;
use crate::event_loop::Loop;
use crate::value::Value;
use std::ops::Deref;
use std::rc::Rc;

/// Fires a callback after a timeout, optionally repeating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer(Handle);

impl Timer {
  pub fn new(event_loop: &Loop) -> Result<Timer, UvError> {
    Handle::create(event_loop, HandleKind::Timer)?
      .init(|native, id| native.timer_init(id))
      .map(Timer)
  }

  /// Arms the timer. `callback` receives the timer handle only. Starting an
  /// armed timer re-arms it and replaces its callback.
  pub fn start(
    &self,
    timeout: u64,
    repeat: u64,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.0.start(CallbackSlot::Start, Rc::new(callback), |native, id| {
      native.timer_start(id, timeout, repeat)
    })
  }

  pub fn stop(&self) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.timer_stop(id))
  }

  /// Re-arms the timer with its repeat value as the timeout. Fails with
  /// `EINVAL` when the repeat value is zero.
  pub fn again(&self) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.timer_again(id))
  }

  pub fn set_repeat(&self, repeat: u64) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.timer_set_repeat(id, repeat))
  }

  pub fn repeat(&self) -> Result<u64, UvError> {
    self
      .0
      .native_query(|native, id| native.timer_repeat(id))?
      .ok_or_else(|| UvError::native(crate::error::UV_EINVAL))
  }
}

impl Deref for Timer {
  type Target = Handle;

  fn deref(&self) -> &Handle {
    &self.0
  }
}

impl From<Timer> for Handle {
  fn from(timer: Timer) -> Handle {
    timer.0
  }
}

impl TryFrom<Handle> for Timer {
  type Error = UvError;

  fn try_from(handle: Handle) -> Result<Self, Self::Error> {
    match handle.kind() {
      HandleKind::Timer => Ok(Timer(handle)),
      kind => Err(UvError::argument(format!("timer expected, got {kind}"))),
    }
  }
}
