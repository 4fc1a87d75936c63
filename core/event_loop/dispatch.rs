// Copyright 2018-2025 the Deno authors. MIT license.

//! Trampolines from native completions into runtime callbacks, and the
//! per-phase drivers that produce those completions.

use super::Loop;
use crate::error::CallbackError;
use crate::error::LoopError;
use crate::error::UV_EOF;
use crate::error::UvError;
use crate::handle::CallbackSlot;
use crate::handle::Handle;
use crate::handle::HandleState;
use crate::native::NativeId;
use crate::native::ReadOutcome;
use crate::registry::Callback;
use crate::request::RequestId;
use crate::value::Value;
use bytes::Bytes;
use smallvec::SmallVec;
use smallvec::smallvec;
use std::task::Context;

type Args = SmallVec<[Value; 4]>;

/// Reads performed on one socket before moving on to the next.
const MAX_READS_PER_TICK: usize = 32;

fn status_value(status: i32) -> Value {
  if status < 0 {
    Value::Error(UvError::native(status))
  } else {
    Value::Nil
  }
}

impl Loop {
  /// Invokes the callback in `slot` of handle `id`. Nothing runs unless the
  /// handle is still open. `args` receives the handle itself (or `Nil` when
  /// its wrapper is gone) and builds the full argument list.
  pub(crate) fn dispatch(
    &self,
    id: NativeId,
    slot: CallbackSlot,
    args: impl FnOnce(Value) -> Args,
  ) {
    let target = {
      let handles = self.0.handles.borrow();
      match handles.get(&id) {
        Some(entry) if entry.flags.open => {
          entry.slots.get(slot).map(|token| (token, entry.object.clone()))
        }
        _ => {
          log::trace!(
            "skipping {slot:?} callback of closed handle {}",
            id.as_raw()
          );
          return;
        }
      }
    };
    let Some((token, object)) = target else {
      return;
    };
    let Some(callback) = self.resolve_token(token) else {
      return;
    };
    let this = object
      .upgrade()
      .map(Handle::from_object)
      .map_or(Value::Nil, Value::Handle);
    log::trace!("firing {slot:?} callback of handle {}", id.as_raw());
    self.invoke(&callback, &args(this));
  }

  fn invoke(&self, callback: &Callback, args: &[Value]) {
    if let Err(err) = callback(args) {
      self.record_failure(err);
    }
  }

  /// Keeps the first failure of the current run and stops the loop.
  fn record_failure(&self, err: CallbackError) {
    let handler = self.0.error_handler.borrow().clone();
    let err = match handler {
      Some(handler) => handler(err),
      None => err,
    };
    log::debug!("callback failed, stopping loop: {err}");
    {
      let mut failure = self.0.failure.borrow_mut();
      if failure.is_none() {
        *failure = Some(LoopError::from_callback(err));
      }
    }
    self.stop();
  }

  /// Completes request `req` with `status`. The request entry and its token
  /// are released whether or not the callback runs; it runs only while the
  /// owning handle is open.
  pub(crate) fn complete_request(&self, req: RequestId, status: i32) {
    let entry = self.0.requests.borrow_mut().remove(&req);
    let Some(entry) = entry else {
      log::warn!("completion for unknown request {}", req.0);
      return;
    };
    let callback = self.resolve_token(entry.token);
    let object = {
      let handles = self.0.handles.borrow();
      handles
        .get(&entry.handle)
        .filter(|handle| handle.flags.open)
        .map(|handle| handle.object.clone())
    };
    self.release_token(entry.token);
    let (Some(callback), Some(object)) = (callback, object) else {
      log::trace!(
        "dropping {:?} completion ({status}) of closed handle {}",
        entry.kind,
        entry.handle.as_raw()
      );
      return;
    };
    let this = object
      .upgrade()
      .map(Handle::from_object)
      .map_or(Value::Nil, Value::Handle);
    self.invoke(&callback, &[this, status_value(status)]);
  }

  /// Frees the native side of a closed handle and runs its close callback.
  /// The table entry goes away only after the callback has returned.
  fn confirm_close(&self, id: NativeId) {
    self.with_native(|native| native.free(id));
    let target = {
      let mut handles = self.0.handles.borrow_mut();
      let Some(entry) = handles.get_mut(&id) else {
        return;
      };
      entry.state = HandleState::Closed;
      (entry.slots.take(CallbackSlot::Close), entry.object.clone())
    };
    log::debug!("handle {} closed", id.as_raw());
    let (token, object) = target;
    if let Some(token) = token {
      let callback = self.0.registry.borrow_mut().release(token);
      if let Some(callback) = callback {
        let this = object
          .upgrade()
          .map(Handle::from_object)
          .map_or(Value::Nil, Value::Handle);
        self.invoke(&callback, &[this]);
      }
    }
    let entry = self.0.handles.borrow_mut().remove(&id);
    if let Some(mut entry) = entry {
      for token in entry.slots.drain() {
        self.release_token(token);
      }
    }
  }

  pub(super) fn run_timers(&self) {
    let limit = self.with_native(|native| native.timer_seq_limit());
    loop {
      let due = self.with_native(|native| {
        let now = native.now();
        native.pop_due_timer(now, limit)
      });
      let Some(id) = due else {
        break;
      };
      self.dispatch(id, CallbackSlot::Start, |this| smallvec![this]);
    }
  }

  pub(super) fn run_io(&self) {
    let _guard = self.enter();
    let waker = self.with_native(|native| native.waker());
    let mut cx = Context::from_waker(&waker);
    let ids = self.with_native(|native| native.tcp_ids());
    for id in ids {
      self.poll_tcp(id, &mut cx);
    }
  }

  fn poll_tcp(&self, id: NativeId, cx: &mut Context) {
    let connected = self.with_native(|native| native.poll_connect(id, cx));
    if let Some((req, status)) = connected {
      self.complete_request(req, status);
    }

    let (before, (after, failed)) = self.with_native(|native| {
      let before = native.backlog_len(id);
      (before, native.poll_accept(id, cx))
    });
    for _ in before..after {
      self.dispatch(id, CallbackSlot::Connection, |this| {
        smallvec![this, Value::Nil]
      });
    }
    if let Some(status) = failed {
      self.dispatch(id, CallbackSlot::Connection, |this| {
        smallvec![this, status_value(status)]
      });
    }

    self.read_tcp(id, cx);

    let written = self.with_native(|native| native.poll_writes(id, cx));
    for (req, status) in written {
      self.complete_request(req, status);
    }
  }

  /// Reads until the socket would block or the handle stops reading, at
  /// most [`MAX_READS_PER_TICK`] times. The read buffer stays busy while the
  /// read callback runs.
  fn read_tcp(&self, id: NativeId, cx: &mut Context) {
    for _ in 0..MAX_READS_PER_TICK {
      if !self.with_native(|native| native.poll_read_ready(id, cx)) {
        return;
      }
      let mut buf = match self.alloc_buffer(self.read_buffer_size()) {
        Ok(buf) => buf,
        Err(err) => {
          self.with_native(|native| native.tcp_read_stop(id));
          self.dispatch(id, CallbackSlot::Read, |this| {
            smallvec![this, Value::Error(err)]
          });
          return;
        }
      };
      let outcome = self.with_native(|native| {
        native.tcp_try_read(id, buf.as_mut_slice(), cx)
      });
      let done = match outcome {
        ReadOutcome::WouldBlock => true,
        ReadOutcome::Data(n) => {
          let data = Bytes::copy_from_slice(&buf.as_slice()[..n]);
          self.dispatch(id, CallbackSlot::Read, |this| {
            smallvec![this, Value::Nil, Value::Bytes(data)]
          });
          false
        }
        ReadOutcome::Eof => {
          self.end_read(id, UV_EOF);
          true
        }
        ReadOutcome::Failed(status) => {
          self.end_read(id, status);
          true
        }
      };
      self.release_buffer(buf);
      if done {
        return;
      }
    }
    // Out of budget with data possibly left; come back next iteration.
    cx.waker().wake_by_ref();
  }

  fn end_read(&self, id: NativeId, status: i32) {
    self.with_native(|native| native.tcp_read_stop(id));
    self.dispatch(id, CallbackSlot::Read, |this| {
      smallvec![this, status_value(status)]
    });
  }

  pub(super) fn run_idle(&self) {
    let ids = self.with_native(|native| native.idle_ids());
    for id in ids {
      // An earlier idle callback may have stopped this one.
      if !self.with_native(|native| native.is_active(id)) {
        continue;
      }
      self.dispatch(id, CallbackSlot::Start, |this| smallvec![this]);
    }
  }

  pub(super) fn run_check(&self) {
    let waker = self.with_native(|native| native.waker());
    let mut cx = Context::from_waker(&waker);
    let changes = self.with_native(|native| native.poll_fs_events(&mut cx));
    for change in changes {
      if !self.with_native(|native| native.is_active(change.id)) {
        continue;
      }
      let err = (change.status < 0).then(|| UvError::native(change.status));
      let filename = change.filename.map_or(Value::Nil, Value::String);
      let events = Value::Integer(i64::from(change.events));
      self.dispatch(change.id, CallbackSlot::Start, |this| {
        smallvec![this, Value::from(err), filename, events]
      });
    }

    let exits = self.with_native(|native| native.poll_exits(&mut cx));
    for exit in exits {
      self.dispatch(exit.id, CallbackSlot::Start, |this| {
        smallvec![
          this,
          Value::Integer(exit.exit_status),
          Value::Integer(i64::from(exit.term_signal))
        ]
      });
      self.close_abandoned(exit.id);
    }
  }

  /// Detached processes keep their handle open after the wrapper is dropped.
  /// Once the child has exited nothing can reach the handle any more.
  fn close_abandoned(&self, id: NativeId) {
    let abandoned = {
      let handles = self.0.handles.borrow();
      handles.get(&id).is_some_and(|entry| {
        entry.flags.open
          && entry.flags.noclose
          && entry.object.strong_count() == 0
      })
    };
    if abandoned && let Err(err) = self.close_handle(id, None) {
      log::debug!("closing abandoned handle {} failed: {err}", id.as_raw());
    }
  }

  pub(super) fn run_close(&self) {
    let cancelled = self.with_native(|native| native.take_cancelled());
    for (req, status) in cancelled {
      self.complete_request(req, status);
    }
    let closing = self.with_native(|native| native.take_closing());
    for id in closing {
      self.confirm_close(id);
    }
  }
}
