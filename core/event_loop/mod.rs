// Copyright 2018-2025 the Deno authors. MIT license.

//! Phase-based event loop matching libuv's architecture.
//!
//! Each iteration of the event loop runs these phases **in order**:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │         timers                │  ← Fire due timers, re-arm repeating ones
//! ├───────────────────────────────┤
//! │          poll                 │  ← Wait for I/O, then TCP sockets
//! ├───────────────────────────────┤
//! │          idle                 │  ← Idle handles, once per iteration
//! ├───────────────────────────────┤
//! │         check                 │  ← Filesystem watchers and process exits
//! ├───────────────────────────────┤
//! │      close callbacks          │  ← Cancelled requests, closes
//! └───────────────────────────────┘
//! ```
//!
//! No `RefCell` borrow of loop state is held while a callback runs, so
//! callbacks may start, stop or close any handle and drop the last owner of
//! any handle.

mod dispatch;
#[cfg(test)]
mod tests;

use crate::arena::BufferArena;
use crate::arena::DEFAULT_BUFFER_SIZE;
use crate::arena::ReadBuffer;
use crate::error::CallbackError;
use crate::error::ErrorMode;
use crate::error::LoopError;
use crate::error::UV_EBUSY;
use crate::error::UvError;
use crate::handle::Handle;
use crate::handle::HandleEntry;
use crate::native::NativeId;
use crate::native::NativeLoop;
use crate::registry::Callback;
use crate::registry::CallbackRegistry;
use crate::registry::CallbackToken;
use crate::request::RequestEntry;
use crate::request::RequestId;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

/// Phase identifiers for the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopPhase {
  /// Phase 1: Execute expired timer callbacks.
  Timers,
  /// Phase 2: Wait for I/O and complete socket operations.
  Poll,
  /// Phase 3: Idle handles.
  Idle,
  /// Phase 4: Filesystem watchers and child process exits.
  Check,
  /// Phase 5: Cancelled requests and close callbacks.
  CloseCallbacks,
}

impl EventLoopPhase {
  /// Returns all phases in execution order.
  pub const fn all() -> &'static [EventLoopPhase] {
    &[
      EventLoopPhase::Timers,
      EventLoopPhase::Poll,
      EventLoopPhase::Idle,
      EventLoopPhase::Check,
      EventLoopPhase::CloseCallbacks,
    ]
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
  /// Iterate until nothing keeps the loop alive or it is stopped.
  #[default]
  Default,
  /// One iteration, waiting for events if there is nothing to do.
  Once,
  /// One iteration without waiting.
  NoWait,
}

/// Why [`Loop::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
  /// No active, referenced handles are left.
  Drained,
  /// A single iteration finished and work remains.
  Alive,
  /// [`Loop::stop`] was called.
  Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
  /// Capacity of the shared read buffer.
  pub buffer_size: usize,
  /// Handles created on this loop raise synchronous failures instead of
  /// returning them.
  pub raise_error: bool,
  /// How often watchers started with `UV_FS_EVENT_STAT` re-examine their
  /// path.
  pub fs_poll_interval: Duration,
}

impl Default for LoopOptions {
  fn default() -> Self {
    Self {
      buffer_size: DEFAULT_BUFFER_SIZE,
      raise_error: false,
      fs_poll_interval: Duration::from_millis(100),
    }
  }
}

/// Loop-wide flags. New handles snapshot `raise_error` when created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopFlags {
  pub raise_error: bool,
  pub default_loop: bool,
  /// [`Loop::close`] leaves the loop running.
  pub noclose: bool,
}

type ErrorHandler = Rc<dyn Fn(CallbackError) -> CallbackError>;

pub(crate) struct LoopInner {
  runtime: tokio::runtime::Runtime,
  native: RefCell<NativeLoop>,
  pub(crate) handles: RefCell<BTreeMap<NativeId, HandleEntry>>,
  pub(crate) requests: RefCell<BTreeMap<RequestId, RequestEntry>>,
  next_request: Cell<u64>,
  registry: RefCell<CallbackRegistry>,
  arena: BufferArena,
  flags: LoopFlags,
  closed: Cell<bool>,
  running: Cell<bool>,
  stop_requested: Cell<bool>,
  failure: RefCell<Option<LoopError>>,
  error_handler: RefCell<Option<ErrorHandler>>,
}

/// A native event loop together with everything the runtime needs to drive
/// it: the handle and request tables, the callback registry and the shared
/// read buffer.
///
/// `Loop` is a cheap reference-counted pointer. It is neither `Send` nor
/// `Sync`; every handle of a loop lives on the thread that created it.
#[derive(Clone)]
pub struct Loop(pub(crate) Rc<LoopInner>);

static_assertions::assert_not_impl_any!(Loop: Send, Sync);

thread_local! {
  static DEFAULT_LOOP: RefCell<Option<Loop>> = const { RefCell::new(None) };
}

/// The calling thread's default loop, created on first use. It is flagged
/// `noclose` and lives until the thread exits.
pub fn default_loop() -> Result<Loop, UvError> {
  DEFAULT_LOOP.with(|cell| {
    if let Some(event_loop) = cell.borrow().as_ref() {
      return Ok(event_loop.clone());
    }
    let flags = LoopFlags {
      raise_error: false,
      default_loop: true,
      noclose: true,
    };
    let event_loop = Loop::with_flags(LoopOptions::default(), flags)?;
    log::debug!("created default loop");
    *cell.borrow_mut() = Some(event_loop.clone());
    Ok(event_loop)
  })
}

impl Loop {
  pub fn new(options: LoopOptions) -> Result<Loop, UvError> {
    let flags = LoopFlags {
      raise_error: options.raise_error,
      ..Default::default()
    };
    Self::with_flags(options, flags)
  }

  fn with_flags(
    options: LoopOptions,
    flags: LoopFlags,
  ) -> Result<Loop, UvError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()?;
    let mut native = NativeLoop::new(options.fs_poll_interval);
    native.update_time();
    Ok(Loop(Rc::new(LoopInner {
      runtime,
      native: RefCell::new(native),
      handles: RefCell::new(BTreeMap::new()),
      requests: RefCell::new(BTreeMap::new()),
      next_request: Cell::new(1),
      registry: RefCell::new(CallbackRegistry::default()),
      arena: BufferArena::new(options.buffer_size),
      flags,
      closed: Cell::new(false),
      running: Cell::new(false),
      stop_requested: Cell::new(false),
      failure: RefCell::new(None),
      error_handler: RefCell::new(None),
    })))
  }

  /// Enters the loop's reactor context. Sockets can only be registered while
  /// the returned guard is alive.
  pub(crate) fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
    self.0.runtime.enter()
  }

  pub(crate) fn with_native<R>(
    &self,
    f: impl FnOnce(&mut NativeLoop) -> R,
  ) -> R {
    let mut native = self.0.native.borrow_mut();
    f(&mut native)
  }

  pub(crate) fn register_callback(&self, callback: Callback) -> CallbackToken {
    self.0.registry.borrow_mut().register(callback)
  }

  /// Releases `token`. The callback is dropped after the registry borrow
  /// ends, since it may own the last reference to a handle.
  pub(crate) fn release_token(&self, token: CallbackToken) {
    let callback = self.0.registry.borrow_mut().release(token);
    drop(callback);
  }

  fn resolve_token(&self, token: CallbackToken) -> Option<Callback> {
    self.0.registry.borrow().resolve(token)
  }

  pub(crate) fn next_request_id(&self) -> RequestId {
    let id = self.0.next_request.get();
    self.0.next_request.set(id + 1);
    RequestId(id)
  }

  pub fn flags(&self) -> LoopFlags {
    self.0.flags
  }

  pub fn is_closed(&self) -> bool {
    self.0.closed.get()
  }

  /// The error mode handles created on this loop start with.
  pub fn error_mode(&self) -> ErrorMode {
    if self.0.flags.raise_error {
      ErrorMode::Raise
    } else {
      ErrorMode::Return
    }
  }

  /// Runs the loop in `mode`.
  ///
  /// A callback that fails stops the loop; the failure is returned once the
  /// current iteration has finished.
  pub fn run(&self, mode: RunMode) -> Result<RunStatus, LoopError> {
    if self.is_closed() {
      return Err(UvError::ResourceClosed.into());
    }
    if self.0.running.replace(true) {
      return Err(UvError::native(UV_EBUSY).into());
    }
    let mut alive = self.alive();
    if !alive {
      self.update_time();
    }
    while alive && !self.0.stop_requested.get() {
      self.tick(mode);
      alive = self.alive();
      if mode != RunMode::Default {
        break;
      }
    }
    self.0.running.set(false);
    let stopped = self.0.stop_requested.replace(false);
    let failure = self.0.failure.borrow_mut().take();
    if let Some(failure) = failure {
      log::debug!("loop stopped by callback failure: {failure}");
      return Err(failure);
    }
    Ok(if stopped {
      RunStatus::Stopped
    } else if alive {
      RunStatus::Alive
    } else {
      RunStatus::Drained
    })
  }

  /// Makes [`Loop::run`] return after the current iteration.
  pub fn stop(&self) {
    self.0.stop_requested.set(true);
  }

  /// Whether any referenced handle is active or a close is pending.
  pub fn alive(&self) -> bool {
    self.with_native(|native| native.has_alive_handles())
  }

  /// Loop time in milliseconds, updated at the start of each iteration.
  pub fn now(&self) -> u64 {
    self.with_native(|native| native.now())
  }

  pub fn update_time(&self) {
    self.with_native(|native| native.update_time());
  }

  /// Closes the loop. Fails with `EBUSY` while any handle has not finished
  /// closing. The default loop is never closed.
  pub fn close(&self) -> Result<(), UvError> {
    if self.0.flags.noclose {
      log::debug!("ignoring close of a noclose loop");
      return Ok(());
    }
    if !self.0.handles.borrow().is_empty() {
      return Err(UvError::native(UV_EBUSY));
    }
    self.0.closed.set(true);
    Ok(())
  }

  /// Calls `f` with every open handle whose wrapper is still alive.
  pub fn walk(&self, mut f: impl FnMut(&Handle)) {
    let handles: Vec<Handle> = self
      .0
      .handles
      .borrow()
      .values()
      .filter(|entry| entry.flags.open)
      .filter_map(HandleEntry::handle)
      .collect();
    for handle in &handles {
      f(handle);
    }
  }

  /// Handles that have not finished closing.
  pub fn handle_count(&self) -> usize {
    self.0.handles.borrow().len()
  }

  /// Requests issued and not yet completed.
  pub fn request_count(&self) -> usize {
    self.0.requests.borrow().len()
  }

  /// Callbacks currently held by the registry.
  pub fn callback_count(&self) -> usize {
    self.0.registry.borrow().len()
  }

  /// Installs a handler applied to every callback failure before it is
  /// recorded.
  pub fn set_error_handler(
    &self,
    handler: impl Fn(CallbackError) -> CallbackError + 'static,
  ) {
    *self.0.error_handler.borrow_mut() = Some(Rc::new(handler));
  }

  /// Hands out the shared read buffer, at its full capacity, whenever it is
  /// free. Otherwise allocates `requested` bytes on the heap.
  pub fn alloc_buffer(
    &self,
    requested: usize,
  ) -> Result<ReadBuffer, UvError> {
    self.0.arena.alloc(requested)
  }

  pub fn release_buffer(&self, buf: ReadBuffer) {
    self.0.arena.release(buf)
  }

  fn read_buffer_size(&self) -> usize {
    match self.0.arena.capacity() {
      0 => DEFAULT_BUFFER_SIZE,
      capacity => capacity,
    }
  }

  /// Blocks until the loop's waker fires or the timeout runs out, driving
  /// the reactor meanwhile.
  fn wait(&self, mode: RunMode) {
    let timeout = if mode == RunMode::NoWait || self.0.stop_requested.get() {
      Some(Duration::ZERO)
    } else {
      self.with_native(|native| native.compute_wait_timeout())
    };
    let wakeup = self.with_native(|native| native.wakeup());
    // Futures are created inside `block_on` so they find the runtime.
    match timeout {
      Some(timeout) if timeout.is_zero() => {
        self.0.runtime.block_on(async { tokio::task::yield_now().await })
      }
      Some(timeout) => self.0.runtime.block_on(async {
        tokio::select! {
          _ = wakeup.0.notified() => {}
          _ = tokio::time::sleep(timeout) => {}
        }
      }),
      None => self.0.runtime.block_on(async { wakeup.0.notified().await }),
    }
  }

  fn tick(&self, mode: RunMode) {
    self.update_time();
    for phase in EventLoopPhase::all() {
      match phase {
        EventLoopPhase::Timers => self.run_timers(),
        EventLoopPhase::Poll => {
          self.wait(mode);
          self.update_time();
          self.run_io();
        }
        EventLoopPhase::Idle => self.run_idle(),
        EventLoopPhase::Check => self.run_check(),
        EventLoopPhase::CloseCallbacks => self.run_close(),
      }
    }
    // A single blocking iteration also fires the timers its wait was for.
    if mode == RunMode::Once {
      self.update_time();
      self.run_timers();
    }
  }
}
