// Copyright 2018-2025 the Deno authors. MIT license.

//! Id-based native event loop primitives.
//!
//! This is the layer that owns sockets, timers, child processes and
//! watchers. It never calls into runtime code: every primitive returns a
//! libuv-style status (`0` or a negative errno) and completion events are
//! handed back to [`crate::Loop`] as plain data for dispatch.

mod fs_event;
mod process;
mod tcp;
mod timer;

pub use fs_event::*;
pub use process::ChildPipe;
pub(crate) use process::ProcessExit;
pub(crate) use process::SpawnSpec;
pub(crate) use process::StdioTarget;
pub(crate) use process::kill_pid;
pub(crate) use tcp::ReadOutcome;

use crate::error::UV_EINVAL;
use crate::handle::HandleKind;
use crate::request::RequestId;
use futures::task::ArcWake;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;
use std::time::Instant;

use fs_event::FsEventState;
use process::ExitWatch;
use process::ProcessState;
use tcp::TcpState;
use timer::TimerKey;
use timer::TimerState;

/// Upper bound on a wait while children run and exits cannot be signalled.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wakes a loop blocked in its poll phase. Sockets, watcher threads and
/// child exits all wake the loop through this.
#[derive(Default)]
pub(crate) struct Wakeup(pub(crate) tokio::sync::Notify);

impl ArcWake for Wakeup {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    arc_self.0.notify_one();
  }
}

/// Identifies one native handle for the lifetime of its loop. Ids are never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeId(u64);

impl NativeId {
  pub fn as_raw(&self) -> u64 {
    self.0
  }
}

pub(crate) enum NativeObject {
  /// Reserved by a wrapper but not initialized yet.
  Reserved,
  Timer(TimerState),
  Idle,
  Tcp(Box<TcpState>),
  FsEvent(FsEventState),
  Process(ProcessState),
}

pub(crate) struct NativeSlot {
  kind: HandleKind,
  active: bool,
  refed: bool,
  closing: bool,
  object: NativeObject,
}

impl NativeSlot {
  fn is_active(&self) -> bool {
    if self.closing {
      return false;
    }
    match &self.object {
      NativeObject::Tcp(tcp) => tcp.is_active(),
      NativeObject::Process(process) => process.is_running(),
      _ => self.active,
    }
  }
}

pub(crate) struct NativeLoop {
  slots: BTreeMap<NativeId, NativeSlot>,
  next_id: u64,
  timers: BTreeSet<TimerKey>,
  next_timer_seq: u64,
  idle: Vec<NativeId>,
  closing: VecDeque<NativeId>,
  cancelled: VecDeque<(RequestId, i32)>,
  orphans: Vec<std::process::Child>,
  exit_watch: ExitWatch,
  time_origin: Instant,
  now_ms: u64,
  fs_poll_interval: Duration,
  wakeup: Arc<Wakeup>,
  waker: Waker,
}

impl NativeLoop {
  pub(crate) fn new(fs_poll_interval: Duration) -> Self {
    let wakeup = Arc::new(Wakeup::default());
    Self {
      slots: BTreeMap::new(),
      next_id: 1,
      timers: BTreeSet::new(),
      next_timer_seq: 1,
      idle: Vec::with_capacity(8),
      closing: VecDeque::with_capacity(16),
      cancelled: VecDeque::new(),
      orphans: Vec::new(),
      exit_watch: ExitWatch::default(),
      time_origin: Instant::now(),
      now_ms: 0,
      fs_poll_interval,
      waker: futures::task::waker(wakeup.clone()),
      wakeup,
    }
  }

  pub(crate) fn wakeup(&self) -> Arc<Wakeup> {
    self.wakeup.clone()
  }

  /// The waker registered with every socket, watcher channel and signal
  /// stream of this loop.
  pub(crate) fn waker(&self) -> Waker {
    self.waker.clone()
  }

  #[inline]
  fn current_time(&self) -> u64 {
    Instant::now().duration_since(self.time_origin).as_millis() as u64
  }

  /// Loop time in milliseconds, cached at the start of each iteration.
  pub(crate) fn now(&self) -> u64 {
    self.now_ms
  }

  pub(crate) fn update_time(&mut self) {
    self.now_ms = self.current_time();
  }

  pub(crate) fn reserve(&mut self, kind: HandleKind) -> NativeId {
    let id = NativeId(self.next_id);
    self.next_id += 1;
    let previous = self.slots.insert(
      id,
      NativeSlot {
        kind,
        active: false,
        refed: true,
        closing: false,
        object: NativeObject::Reserved,
      },
    );
    assert!(previous.is_none());
    id
  }

  fn init_object(
    &mut self,
    id: NativeId,
    kind: HandleKind,
    object: NativeObject,
  ) -> i32 {
    match self.slots.get_mut(&id) {
      Some(slot)
        if slot.kind == kind
          && matches!(slot.object, NativeObject::Reserved) =>
      {
        slot.object = object;
        0
      }
      _ => UV_EINVAL,
    }
  }

  fn object_mut(&mut self, id: NativeId) -> Option<&mut NativeObject> {
    self
      .slots
      .get_mut(&id)
      .filter(|slot| !slot.closing)
      .map(|slot| &mut slot.object)
  }

  /// Drops the native state for `id`. Used both after close confirmation
  /// and to undo a failed initialization.
  pub(crate) fn free(&mut self, id: NativeId) {
    if let Some(slot) = self.slots.remove(&id) {
      self.detach(id, slot.object);
    }
  }

  fn detach(&mut self, id: NativeId, object: NativeObject) {
    match object {
      NativeObject::Timer(timer) => {
        if let Some(key) = timer.key {
          self.timers.remove(&key);
        }
      }
      NativeObject::Idle => self.idle.retain(|h| *h != id),
      NativeObject::Tcp(mut tcp) => tcp.cancel_all(&mut self.cancelled),
      NativeObject::Process(mut process) => {
        if let Some(child) = process.release_child() {
          self.orphans.push(child);
        }
      }
      NativeObject::FsEvent(_) | NativeObject::Reserved => {}
    }
  }

  /// Starts closing `id`. The handle stops being active immediately and is
  /// reported by [`NativeLoop::take_closing`] on the next close phase.
  pub(crate) fn close(&mut self, id: NativeId) -> i32 {
    let Some(slot) = self.slots.get_mut(&id) else {
      return UV_EINVAL;
    };
    if slot.closing {
      return UV_EINVAL;
    }
    slot.closing = true;
    slot.active = false;
    let object = std::mem::replace(&mut slot.object, NativeObject::Reserved);
    self.detach(id, object);
    self.closing.push_back(id);
    0
  }

  pub(crate) fn take_closing(&mut self) -> Vec<NativeId> {
    self.closing.drain(..).collect()
  }

  /// Requests that were outstanding when their handle was closed.
  pub(crate) fn take_cancelled(&mut self) -> Vec<(RequestId, i32)> {
    self.cancelled.drain(..).collect()
  }

  pub(crate) fn is_active(&self, id: NativeId) -> bool {
    self.slots.get(&id).is_some_and(NativeSlot::is_active)
  }

  #[cfg(test)]
  pub(crate) fn is_closing(&self, id: NativeId) -> bool {
    self.slots.get(&id).is_some_and(|slot| slot.closing)
  }

  pub(crate) fn set_ref(&mut self, id: NativeId, refed: bool) {
    if let Some(slot) = self.slots.get_mut(&id) {
      slot.refed = refed;
    }
  }

  pub(crate) fn has_ref(&self, id: NativeId) -> bool {
    self.slots.get(&id).is_some_and(|slot| slot.refed)
  }

  pub(crate) fn has_alive_handles(&self) -> bool {
    if !self.closing.is_empty() || !self.cancelled.is_empty() {
      return true;
    }
    self
      .slots
      .values()
      .any(|slot| slot.refed && slot.is_active())
  }

  fn next_timer_deadline_ms(&self) -> Option<u64> {
    self.timers.iter().next().map(|k| k.deadline_ms)
  }

  /// How long the poll phase may block. `None` means until the waker
  /// fires.
  pub(crate) fn compute_wait_timeout(&self) -> Option<Duration> {
    if !self.idle.is_empty()
      || !self.closing.is_empty()
      || !self.cancelled.is_empty()
    {
      return Some(Duration::ZERO);
    }
    let timer = self.next_timer_deadline_ms().map(|deadline| {
      Duration::from_millis(deadline.saturating_sub(self.current_time()))
    });
    if !self.exit_watch.is_armed() && self.has_running_processes() {
      return Some(timer.map_or(EXIT_POLL_INTERVAL, |t| {
        t.min(EXIT_POLL_INTERVAL)
      }));
    }
    timer
  }

  pub(crate) fn idle_init(&mut self, id: NativeId) -> i32 {
    self.init_object(id, HandleKind::Idle, NativeObject::Idle)
  }

  pub(crate) fn idle_start(&mut self, id: NativeId) -> i32 {
    let Some(slot) = self.slots.get_mut(&id) else {
      return UV_EINVAL;
    };
    if slot.closing || !matches!(slot.object, NativeObject::Idle) {
      return UV_EINVAL;
    }
    if !slot.active {
      slot.active = true;
      self.idle.push(id);
    }
    0
  }

  pub(crate) fn idle_stop(&mut self, id: NativeId) -> i32 {
    let Some(slot) = self.slots.get_mut(&id) else {
      return UV_EINVAL;
    };
    if !matches!(slot.object, NativeObject::Idle) {
      return UV_EINVAL;
    }
    slot.active = false;
    self.idle.retain(|h| *h != id);
    0
  }

  pub(crate) fn idle_ids(&self) -> Vec<NativeId> {
    self.idle.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn native() -> NativeLoop {
    NativeLoop::new(Duration::from_millis(100))
  }

  #[test]
  fn test_ids_are_not_reused() {
    let mut native = native();
    let a = native.reserve(HandleKind::Idle);
    native.free(a);
    let b = native.reserve(HandleKind::Idle);
    assert_ne!(a, b);
  }

  #[test]
  fn test_init_requires_matching_reservation() {
    let mut native = native();
    let id = native.reserve(HandleKind::Timer);
    assert_eq!(native.idle_init(id), UV_EINVAL);
    assert_eq!(native.timer_init(id), 0);
    assert_eq!(native.timer_init(id), UV_EINVAL);
  }

  #[test]
  fn test_idle_keeps_loop_alive_until_unref() {
    let mut native = native();
    let id = native.reserve(HandleKind::Idle);
    assert_eq!(native.idle_init(id), 0);
    assert!(!native.has_alive_handles());
    assert_eq!(native.idle_start(id), 0);
    assert!(native.has_alive_handles());
    assert_eq!(native.compute_wait_timeout(), Some(Duration::ZERO));
    native.set_ref(id, false);
    assert!(!native.has_alive_handles());
  }

  #[test]
  fn test_wait_is_unbounded_without_timers() {
    let mut native = native();
    assert_eq!(native.compute_wait_timeout(), None);
    let id = native.reserve(HandleKind::Timer);
    native.timer_init(id);
    native.update_time();
    native.timer_start(id, 60_000, 0);
    let timeout = native.compute_wait_timeout().unwrap();
    assert!(timeout > Duration::from_secs(59));
    assert!(timeout <= Duration::from_secs(60));
  }

  #[test]
  fn test_close_queues_confirmation() {
    let mut native = native();
    let id = native.reserve(HandleKind::Idle);
    native.idle_init(id);
    native.idle_start(id);
    assert_eq!(native.close(id), 0);
    assert!(native.is_closing(id));
    assert!(!native.is_active(id));
    assert!(native.idle_ids().is_empty());
    assert_eq!(native.close(id), UV_EINVAL);
    assert_eq!(native.take_closing(), vec![id]);
    native.free(id);
    assert!(!native.has_alive_handles());
  }
}
