// Copyright 2018-2025 the Deno authors. MIT license.
use crate::error::CallbackError;
use crate::event_loop::Loop;
use crate::event_loop::LoopOptions;
use crate::handle::Handle;
use crate::handle::Timer;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

mod fs_event;
mod idle;
mod tcp;
mod timer;

pub fn setup() -> Loop {
  Loop::new(LoopOptions::default()).unwrap()
}

/// Fails the run if it is still going after `timeout_ms`. The watchdog is
/// unreferenced, so it never keeps the loop alive on its own.
pub fn watchdog(event_loop: &Loop, timeout_ms: u64) -> Timer {
  let timer = Timer::new(event_loop).unwrap();
  timer
    .start(timeout_ms, 0, |_| Err(CallbackError::thrown("watchdog fired")))
    .unwrap();
  timer.unref().unwrap();
  timer
}

/// The handle a callback was invoked for.
pub fn this(args: &[Value]) -> Handle {
  args[0].as_handle().expect("callback without its handle").clone()
}

/// Collects whatever callbacks push into it.
pub struct Recorder<T>(Rc<RefCell<Vec<T>>>);

impl<T> Clone for Recorder<T> {
  fn clone(&self) -> Self {
    Self(self.0.clone())
  }
}

impl<T> Default for Recorder<T> {
  fn default() -> Self {
    Self(Rc::default())
  }
}

impl<T: Clone> Recorder<T> {
  pub fn push(&self, value: T) {
    self.0.borrow_mut().push(value);
  }

  pub fn get(&self) -> Vec<T> {
    self.0.borrow().clone()
  }
}
