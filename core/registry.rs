// Copyright 2018-2025 the Deno authors. MIT license.

use crate::error::CallbackError;
use crate::value::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::rc::Rc;

/// A function stored on behalf of the runtime. Receives the callback
/// arguments, the first of which is always the owning handle (or `Nil` if
/// its wrapper is gone).
pub type Callback = Rc<dyn Fn(&[Value]) -> Result<(), CallbackError>>;

/// Wraps a closure as a [`Callback`].
pub fn callback(
  f: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
) -> Callback {
  Rc::new(f)
}

/// Opaque reference to a [`Callback`] held in a [`CallbackRegistry`].
///
/// Tokens are never reused within a registry, so a stale token can only ever
/// miss, never resolve to somebody else's callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackToken(NonZeroU64);

impl CallbackToken {
  pub fn as_raw(&self) -> u64 {
    self.0.get()
  }
}

/// Keeps runtime callbacks reachable while native code holds nothing but an
/// integer reference to them.
#[derive(Default)]
pub struct CallbackRegistry {
  index: BTreeMap<CallbackToken, Callback>,
  next_token: u64,
}

impl CallbackRegistry {
  /// Stores `callback` and returns the token it can be resolved with.
  pub fn register(&mut self, callback: Callback) -> CallbackToken {
    self.next_token += 1;
    // The counter starts at zero and only grows, so it is never zero here.
    let token = CallbackToken(
      NonZeroU64::new(self.next_token).unwrap_or(NonZeroU64::MIN),
    );
    let previous = self.index.insert(token, callback);
    assert!(previous.is_none());
    token
  }

  /// Looks up the callback for `token` without releasing it.
  pub fn resolve(&self, token: CallbackToken) -> Option<Callback> {
    self.index.get(&token).cloned()
  }

  /// Removes the callback for `token` and hands it back. The caller decides
  /// when the callback is dropped, which matters when the callback owns
  /// handles whose finalizers re-enter the loop.
  pub fn release(&mut self, token: CallbackToken) -> Option<Callback> {
    let removed = self.index.remove(&token);
    if removed.is_none() {
      log::warn!("release of unknown callback token {}", token.as_raw());
    }
    removed
  }

  pub fn contains(&self, token: CallbackToken) -> bool {
    self.index.contains_key(&token)
  }

  pub fn len(&self) -> usize {
    self.index.len()
  }

  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }
}
