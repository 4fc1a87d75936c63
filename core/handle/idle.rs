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

/// Runs a callback once per loop iteration while started. An active idle
/// handle keeps the loop from blocking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Idle(Handle);

impl Idle {
  pub fn new(event_loop: &Loop) -> Result<Idle, UvError> {
    Handle::create(event_loop, HandleKind::Idle)?
      .init(|native, id| native.idle_init(id))
      .map(Idle)
  }

  pub fn start(
    &self,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.0.start(CallbackSlot::Start, Rc::new(callback), |native, id| {
      native.idle_start(id)
    })
  }

  pub fn stop(&self) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.idle_stop(id))
  }
}

impl Deref for Idle {
  type Target = Handle;

  fn deref(&self) -> &Handle {
    &self.0
  }
}

impl From<Idle> for Handle {
  fn from(idle: Idle) -> Handle {
    idle.0
  }
}

impl TryFrom<Handle> for Idle {
  type Error = UvError;

  fn try_from(handle: Handle) -> Result<Self, Self::Error> {
    match handle.kind() {
      HandleKind::Idle => Ok(Idle(handle)),
      kind => Err(UvError::argument(format!("idle expected, got {kind}"))),
    }
  }
}
