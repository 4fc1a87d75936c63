// Copyright 2018-2025 the Deno authors. MIT license.
use super::NativeId;
use super::NativeLoop;
use super::NativeObject;
use crate::error::UV_EINVAL;
use crate::handle::HandleKind;

/// Ordering key of an armed timer. Timers with the same deadline fire in the
/// order they were started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
  pub(crate) deadline_ms: u64,
  seq: u64,
  id: NativeId,
}

#[derive(Debug, Default)]
pub(crate) struct TimerState {
  pub(crate) key: Option<TimerKey>,
  repeat: u64,
  started: bool,
}

impl NativeLoop {
  pub(crate) fn timer_init(&mut self, id: NativeId) -> i32 {
    self.init_object(
      id,
      HandleKind::Timer,
      NativeObject::Timer(TimerState::default()),
    )
  }

  pub(crate) fn timer_start(
    &mut self,
    id: NativeId,
    timeout: u64,
    repeat: u64,
  ) -> i32 {
    let now = self.now_ms;
    let Some(slot) = self.slots.get_mut(&id).filter(|s| !s.closing) else {
      return UV_EINVAL;
    };
    let NativeObject::Timer(timer) = &mut slot.object else {
      return UV_EINVAL;
    };
    if let Some(key) = timer.key.take() {
      self.timers.remove(&key);
    }
    let key = TimerKey {
      deadline_ms: now.saturating_add(timeout),
      seq: self.next_timer_seq,
      id,
    };
    self.next_timer_seq += 1;
    self.timers.insert(key);
    timer.key = Some(key);
    timer.repeat = repeat;
    timer.started = true;
    slot.active = true;
    0
  }

  pub(crate) fn timer_stop(&mut self, id: NativeId) -> i32 {
    let Some(slot) = self.slots.get_mut(&id) else {
      return UV_EINVAL;
    };
    let NativeObject::Timer(timer) = &mut slot.object else {
      return UV_EINVAL;
    };
    if let Some(key) = timer.key.take() {
      self.timers.remove(&key);
    }
    slot.active = false;
    0
  }

  /// Restarts a repeating timer using its repeat value as the timeout.
  /// Timers without a repeat value, or never started, are refused.
  pub(crate) fn timer_again(&mut self, id: NativeId) -> i32 {
    let repeat = match self.object_mut(id) {
      Some(NativeObject::Timer(timer)) if timer.started => timer.repeat,
      _ => return UV_EINVAL,
    };
    if repeat == 0 {
      return UV_EINVAL;
    }
    self.timer_start(id, repeat, repeat)
  }

  pub(crate) fn timer_repeat(&self, id: NativeId) -> Option<u64> {
    match self.slots.get(&id).map(|slot| &slot.object) {
      Some(NativeObject::Timer(timer)) => Some(timer.repeat),
      _ => None,
    }
  }

  pub(crate) fn timer_set_repeat(&mut self, id: NativeId, repeat: u64) -> i32 {
    match self.object_mut(id) {
      Some(NativeObject::Timer(timer)) => {
        timer.repeat = repeat;
        0
      }
      _ => UV_EINVAL,
    }
  }

  /// Every timer started from now on gets a sequence number at or above the
  /// returned value.
  pub(crate) fn timer_seq_limit(&self) -> u64 {
    self.next_timer_seq
  }

  /// Pops the next timer due at `now` that was armed before `limit`, and
  /// re-arms it if it repeats. Timers armed while the timer phase runs are
  /// left for the next iteration.
  pub(crate) fn pop_due_timer(
    &mut self,
    now: u64,
    limit: u64,
  ) -> Option<NativeId> {
    let key = *self
      .timers
      .iter()
      .take_while(|k| k.deadline_ms <= now)
      .find(|k| k.seq < limit)?;
    self.timers.remove(&key);
    if let Some(slot) = self.slots.get_mut(&key.id)
      && let NativeObject::Timer(timer) = &mut slot.object
    {
      if timer.repeat > 0 {
        let next = TimerKey {
          deadline_ms: now.saturating_add(timer.repeat),
          seq: self.next_timer_seq,
          id: key.id,
        };
        self.next_timer_seq += 1;
        self.timers.insert(next);
        timer.key = Some(next);
      } else {
        timer.key = None;
        slot.active = false;
      }
    }
    Some(key.id)
  }
}
