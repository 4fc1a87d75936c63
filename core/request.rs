// Copyright 2018-2025 the Deno authors. MIT license.
use crate::event_loop::Loop;
use crate::handle::Handle;
use crate::native::NativeId;
use crate::native::NativeLoop;
use crate::registry::Callback;
use crate::registry::CallbackToken;

/// Identifies an in-flight request within its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Connect,
  Write,
  Shutdown,
}

/// Bookkeeping for an issued request, owned by the loop until its
/// completion is dispatched.
#[derive(Debug)]
pub(crate) struct RequestEntry {
  pub(crate) handle: NativeId,
  pub(crate) kind: RequestKind,
  pub(crate) token: CallbackToken,
}

/// A one-shot operation that has been prepared but not yet accepted by the
/// native loop. It owns its completion callback until it is issued; dropping
/// it (or calling [`Request::discard`]) releases the callback.
pub(crate) struct Request {
  event_loop: Loop,
  id: RequestId,
  handle: NativeId,
  kind: RequestKind,
  token: Option<CallbackToken>,
}

impl std::fmt::Debug for Request {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("id", &self.id)
      .field("handle", &self.handle)
      .field("kind", &self.kind)
      .field("token", &self.token)
      .finish()
  }
}

impl Request {
  pub(crate) fn new(
    handle: &Handle,
    kind: RequestKind,
    callback: Callback,
  ) -> Request {
    let event_loop = handle.event_loop().clone();
    let id = event_loop.next_request_id();
    let token = event_loop.register_callback(callback);
    Request {
      event_loop,
      id,
      handle: handle.id(),
      kind,
      token: Some(token),
    }
  }

  /// Hands the request to the native loop. When the native call refuses it,
  /// the request comes back to the caller together with the status, and the
  /// completion callback will never run.
  pub(crate) fn issue(
    mut self,
    f: impl FnOnce(&mut NativeLoop, RequestId) -> i32,
  ) -> Result<RequestId, (Request, i32)> {
    let id = self.id;
    let token = self.token.take();
    let status = self.event_loop.with_native(|native| f(native, id));
    if status < 0 {
      self.token = token;
      return Err((self, status));
    }
    log::trace!("issued {:?} request {}", self.kind, id.0);
    if let Some(token) = token {
      self.event_loop.0.requests.borrow_mut().insert(
        id,
        RequestEntry {
          handle: self.handle,
          kind: self.kind,
          token,
        },
      );
    }
    Ok(id)
  }

  pub(crate) fn discard(self) {
    log::trace!("discarding {:?} request {}", self.kind, self.id.0);
  }
}

impl Drop for Request {
  fn drop(&mut self) {
    if let Some(token) = self.token.take() {
      self.event_loop.release_token(token);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::UV_ENOTCONN;
  use crate::event_loop::LoopOptions;
  use crate::handle::Tcp;
  use crate::value::Value;
  use pretty_assertions::assert_eq;
  use std::rc::Rc;

  #[test]
  fn test_refused_issue_hands_callback_back() {
    let event_loop = Loop::new(LoopOptions::default()).unwrap();
    let tcp = Tcp::new(&event_loop).unwrap();
    let request =
      Request::new(&tcp, RequestKind::Write, Rc::new(|_: &[Value]| Ok(())));
    assert_eq!(event_loop.callback_count(), 1);
    let (request, status) = request.issue(|_, _| UV_ENOTCONN).unwrap_err();
    assert_eq!(status, UV_ENOTCONN);
    assert_eq!(event_loop.request_count(), 0);
    assert_eq!(event_loop.callback_count(), 1);
    request.discard();
    assert_eq!(event_loop.callback_count(), 0);
  }

  #[test]
  fn test_issued_request_owns_callback_until_completion() {
    let event_loop = Loop::new(LoopOptions::default()).unwrap();
    let tcp = Tcp::new(&event_loop).unwrap();
    let request =
      Request::new(&tcp, RequestKind::Write, Rc::new(|_: &[Value]| Ok(())));
    let id = request.issue(|_, _| 0).unwrap();
    assert_eq!(event_loop.request_count(), 1);
    assert_eq!(event_loop.callback_count(), 1);
    event_loop.complete_request(id, 0);
    assert_eq!(event_loop.request_count(), 0);
    assert_eq!(event_loop.callback_count(), 0);
  }
}
