// Copyright 2018-2025 the Deno authors. MIT license.

//! Runtime-visible wrappers around native handles.
//!
//! A [`Handle`] is a reference-counted wrapper. The loop keeps a
//! [`HandleEntry`] for every handle that has not finished closing, with a
//! weak pointer back to the wrapper so callbacks can be handed their own
//! handle. Dropping the last wrapper finalizes the handle, which closes it
//! unless it is flagged `noclose`.

mod fs_event;
mod idle;
mod process;
mod tcp;
mod timer;

pub use fs_event::FsEvent;
pub use idle::Idle;
pub use process::Process;
pub use process::kill;
pub use tcp::SocketAddress;
pub use tcp::Tcp;
pub use timer::Timer;

use crate::error::CallbackError;
use crate::error::ErrorMode;
use crate::error::UvError;
use crate::error::check_status;
use crate::event_loop::Loop;
use crate::event_loop::LoopFlags;
use crate::native::NativeId;
use crate::native::NativeLoop;
use crate::registry::Callback;
use crate::registry::CallbackToken;
use crate::value::Value;
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
  Timer,
  Idle,
  Tcp,
  FsEvent,
  Process,
}

impl HandleKind {
  pub fn name(&self) -> &'static str {
    match self {
      HandleKind::Timer => "timer",
      HandleKind::Idle => "idle",
      HandleKind::Tcp => "tcp",
      HandleKind::FsEvent => "fs_event",
      HandleKind::Process => "process",
    }
  }

  pub fn is_stream(&self) -> bool {
    matches!(self, HandleKind::Tcp)
  }
}

impl fmt::Display for HandleKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Per-handle flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleFlags {
  /// Initialized and not yet closed. Callbacks only run while this is set.
  pub open: bool,
  /// Finalization leaves the native handle running.
  pub noclose: bool,
  pub stream: bool,
  pub raise_error: bool,
}

impl HandleFlags {
  /// Flags a new handle of `kind` starts with. Only the error mode is
  /// inherited from the loop.
  pub(crate) fn inherited(loop_flags: LoopFlags, kind: HandleKind) -> Self {
    Self {
      open: false,
      noclose: false,
      stream: kind.is_stream(),
      raise_error: loop_flags.raise_error,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
  /// Reserved but not initialized.
  Created,
  Open,
  /// Close requested, confirmation still pending.
  Closing,
  Closed,
}

/// The callback roles a handle can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackSlot {
  Start = 0,
  Read = 1,
  Connection = 2,
  Close = 3,
}

#[derive(Debug, Default)]
pub(crate) struct CallbackSlots([Option<CallbackToken>; 4]);

impl CallbackSlots {
  pub(crate) fn get(&self, slot: CallbackSlot) -> Option<CallbackToken> {
    self.0[slot as usize]
  }

  pub(crate) fn replace(
    &mut self,
    slot: CallbackSlot,
    token: CallbackToken,
  ) -> Option<CallbackToken> {
    self.0[slot as usize].replace(token)
  }

  pub(crate) fn take(&mut self, slot: CallbackSlot) -> Option<CallbackToken> {
    self.0[slot as usize].take()
  }

  pub(crate) fn drain(&mut self) -> SmallVec<[CallbackToken; 4]> {
    self.0.iter_mut().filter_map(Option::take).collect()
  }
}

pub(crate) struct HandleEntry {
  pub(crate) kind: HandleKind,
  pub(crate) flags: HandleFlags,
  pub(crate) state: HandleState,
  pub(crate) slots: CallbackSlots,
  pub(crate) object: Weak<HandleObject>,
}

impl HandleEntry {
  /// The wrapper for this entry, if the runtime still holds one.
  pub(crate) fn handle(&self) -> Option<Handle> {
    self.object.upgrade().map(Handle::from_object)
  }
}

pub(crate) struct HandleObject {
  event_loop: Loop,
  id: NativeId,
  kind: HandleKind,
}

impl Drop for HandleObject {
  fn drop(&mut self) {
    self.event_loop.finalize_handle(self.id);
  }
}

#[derive(Clone)]
pub struct Handle(Rc<HandleObject>);

impl fmt::Debug for Handle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Handle")
      .field("kind", &self.0.kind)
      .field("id", &self.0.id.as_raw())
      .finish()
  }
}

impl PartialEq for Handle {
  fn eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.0, &other.0)
  }
}

impl Eq for Handle {}

impl Handle {
  pub(crate) fn from_object(object: Rc<HandleObject>) -> Handle {
    Handle(object)
  }

  /// Reserves a native slot and a table entry for a handle of `kind`. The
  /// handle is not open until [`Handle::init`] succeeds.
  pub(crate) fn create(
    event_loop: &Loop,
    kind: HandleKind,
  ) -> Result<Handle, UvError> {
    if event_loop.is_closed() {
      return Err(UvError::ResourceClosed);
    }
    let id = event_loop.with_native(|native| native.reserve(kind));
    let object = Rc::new(HandleObject {
      event_loop: event_loop.clone(),
      id,
      kind,
    });
    let entry = HandleEntry {
      kind,
      flags: HandleFlags::inherited(event_loop.flags(), kind),
      state: HandleState::Created,
      slots: CallbackSlots::default(),
      object: Rc::downgrade(&object),
    };
    event_loop.0.handles.borrow_mut().insert(id, entry);
    Ok(Handle(object))
  }

  /// Runs the native initializer. On failure the reservation is undone and
  /// the error returned; the wrapper never becomes visible.
  pub(crate) fn init(
    self,
    f: impl FnOnce(&mut NativeLoop, NativeId) -> i32,
  ) -> Result<Handle, UvError> {
    let id = self.id();
    let status = self.event_loop().with_native(|native| f(native, id));
    if status < 0 {
      self.cleanup();
      return Err(UvError::native(status));
    }
    self.update_entry(|entry| {
      entry.flags.open = true;
      entry.state = HandleState::Open;
    });
    Ok(self)
  }

  fn cleanup(self) {
    let id = self.id();
    let event_loop = self.event_loop().clone();
    let tokens = {
      let mut handles = event_loop.0.handles.borrow_mut();
      handles
        .remove(&id)
        .map(|mut entry| entry.slots.drain())
        .unwrap_or_default()
    };
    event_loop.with_native(|native| native.free(id));
    for token in tokens {
      event_loop.release_token(token);
    }
    // The entry is gone, so finalizing the wrapper is a no-op.
    drop(self);
  }

  fn update_entry<R>(
    &self,
    f: impl FnOnce(&mut HandleEntry) -> R,
  ) -> Option<R> {
    let mut handles = self.0.event_loop.0.handles.borrow_mut();
    handles.get_mut(&self.0.id).map(f)
  }

  fn read_entry<R>(&self, f: impl FnOnce(&HandleEntry) -> R) -> Option<R> {
    let handles = self.0.event_loop.0.handles.borrow();
    handles.get(&self.0.id).map(f)
  }

  pub fn kind(&self) -> HandleKind {
    self.0.kind
  }

  pub fn id(&self) -> NativeId {
    self.0.id
  }

  pub fn event_loop(&self) -> &Loop {
    &self.0.event_loop
  }

  pub fn state(&self) -> HandleState {
    self.read_entry(|entry| entry.state).unwrap_or(HandleState::Closed)
  }

  pub fn flags(&self) -> HandleFlags {
    self.read_entry(|entry| entry.flags).unwrap_or_default()
  }

  pub fn is_open(&self) -> bool {
    self.flags().open
  }

  pub fn error_mode(&self) -> ErrorMode {
    if self.flags().raise_error {
      ErrorMode::Raise
    } else {
      ErrorMode::Return
    }
  }

  /// Splits the result of an operation on this handle by its error mode.
  /// Operations themselves always return `Err`; bindings route through
  /// this before handing the result to runtime code.
  pub fn route<T>(
    &self,
    result: Result<T, UvError>,
  ) -> Result<Result<T, UvError>, UvError> {
    self.error_mode().route(result)
  }

  pub(crate) fn check_open(&self) -> Result<(), UvError> {
    if self.is_open() {
      Ok(())
    } else {
      Err(UvError::ResourceClosed)
    }
  }

  /// Runs a native primitive against this handle, which must be open.
  pub(crate) fn native_call(
    &self,
    f: impl FnOnce(&mut NativeLoop, NativeId) -> i32,
  ) -> Result<(), UvError> {
    let status = self.native_query(f)?;
    check_status(status)
  }

  pub(crate) fn native_query<R>(
    &self,
    f: impl FnOnce(&mut NativeLoop, NativeId) -> R,
  ) -> Result<R, UvError> {
    self.check_open()?;
    let id = self.id();
    Ok(self.event_loop().with_native(|native| f(native, id)))
  }

  /// Stores `callback` in `slot`, releasing whatever it replaces.
  pub(crate) fn set_callback(&self, slot: CallbackSlot, callback: Callback) {
    let token = self.event_loop().register_callback(callback);
    let previous = self
      .update_entry(|entry| entry.slots.replace(slot, token))
      .flatten();
    if let Some(previous) = previous {
      self.event_loop().release_token(previous);
    }
  }

  /// Registers `callback` for `slot` and starts the native watcher. If the
  /// native start fails the new callback is released and the one it
  /// replaced is put back.
  pub(crate) fn start(
    &self,
    slot: CallbackSlot,
    callback: Callback,
    f: impl FnOnce(&mut NativeLoop, NativeId) -> i32,
  ) -> Result<(), UvError> {
    self.check_open()?;
    let event_loop = self.event_loop();
    let token = event_loop.register_callback(callback);
    let previous = self
      .update_entry(|entry| entry.slots.replace(slot, token))
      .flatten();
    let id = self.id();
    let status = event_loop.with_native(|native| f(native, id));
    let stale = if status < 0 {
      self
        .update_entry(|entry| match previous {
          Some(previous) => entry.slots.replace(slot, previous),
          None => entry.slots.take(slot),
        })
        .flatten()
    } else {
      previous
    };
    if let Some(stale) = stale {
      event_loop.release_token(stale);
    }
    check_status(status)
  }

  pub(crate) fn set_noclose(&self, noclose: bool) {
    self.update_entry(|entry| entry.flags.noclose = noclose);
  }

  pub fn is_active(&self) -> Result<bool, UvError> {
    self.native_query(|native, id| native.is_active(id))
  }

  pub fn is_closing(&self) -> bool {
    matches!(self.state(), HandleState::Closing)
  }

  /// Makes the handle keep the loop alive while active.
  pub fn ref_(&self) -> Result<(), UvError> {
    self.native_query(|native, id| native.set_ref(id, true))
  }

  pub fn unref(&self) -> Result<(), UvError> {
    self.native_query(|native, id| native.set_ref(id, false))
  }

  pub fn has_ref(&self) -> Result<bool, UvError> {
    self.native_query(|native, id| native.has_ref(id))
  }

  pub fn close(&self) -> Result<(), UvError> {
    self.event_loop().close_handle(self.id(), None)
  }

  /// Closes the handle and runs `callback` once the native side confirms.
  pub fn close_with(
    &self,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.event_loop().close_handle(self.id(), Some(Rc::new(callback)))
  }
}

impl Loop {
  /// Moves an open handle to closing. Every callback it holds is released
  /// up front so none of them can run again; `on_close` is kept for the
  /// close confirmation.
  pub(crate) fn close_handle(
    &self,
    id: NativeId,
    on_close: Option<Callback>,
  ) -> Result<(), UvError> {
    let tokens = {
      let mut handles = self.0.handles.borrow_mut();
      let entry = handles.get_mut(&id).ok_or(UvError::ResourceClosed)?;
      if !entry.flags.open {
        return Err(UvError::ResourceClosed);
      }
      entry.flags.open = false;
      entry.state = HandleState::Closing;
      entry.slots.drain()
    };
    for token in tokens {
      self.release_token(token);
    }
    if let Some(on_close) = on_close {
      let token = self.register_callback(on_close);
      let mut handles = self.0.handles.borrow_mut();
      if let Some(entry) = handles.get_mut(&id) {
        entry.slots.replace(CallbackSlot::Close, token);
      }
    }
    let status = self.with_native(|native| native.close(id));
    log::trace!("closing handle {}: {status}", id.as_raw());
    check_status(status)
  }

  /// Called when the last wrapper for `id` goes away.
  pub(crate) fn finalize_handle(&self, id: NativeId) {
    let (open, noclose) = {
      let handles = self.0.handles.borrow();
      match handles.get(&id) {
        Some(entry) => (entry.flags.open, entry.flags.noclose),
        None => return,
      }
    };
    if open && !noclose {
      if let Err(err) = self.close_handle(id, None) {
        log::debug!("finalizing handle {} failed: {err}", id.as_raw());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_callback_slots() {
    let mut registry = crate::registry::CallbackRegistry::default();
    let a = registry.register(Rc::new(|_: &[Value]| Ok(())));
    let b = registry.register(Rc::new(|_: &[Value]| Ok(())));
    let mut slots = CallbackSlots::default();
    assert_eq!(slots.replace(CallbackSlot::Start, a), None);
    assert_eq!(slots.replace(CallbackSlot::Start, b), Some(a));
    slots.replace(CallbackSlot::Close, a);
    assert_eq!(slots.get(CallbackSlot::Close), Some(a));
    assert_eq!(slots.drain().len(), 2);
    assert_eq!(slots.get(CallbackSlot::Start), None);
  }

  #[test]
  fn test_flags_inherit_error_mode() {
    let flags = HandleFlags::inherited(
      LoopFlags {
        raise_error: true,
        default_loop: true,
        noclose: true,
      },
      HandleKind::Tcp,
    );
    assert!(flags.raise_error);
    assert!(flags.stream);
    assert!(!flags.noclose);
    assert!(!flags.open);
  }
}
