// Copyright 2018-2025 the Deno authors. MIT license.

//! Structured failures for the handle/request layer.
//!
//! Native primitives report failures as negative status codes. Everything
//! above the native layer converts those codes into [`UvError`] before they
//! reach a caller or a callback.

use std::borrow::Cow;
use std::fmt;
use std::fmt::Write as _;

// libuv-compatible error codes (negative errno values on unix,
// which vary depending on platform, fixed values on windows).
macro_rules! uv_errno {
  ($name:ident, $unix:expr, $win:expr) => {
    #[cfg(unix)]
    pub const $name: i32 = -($unix);
    #[cfg(windows)]
    pub const $name: i32 = $win;
  };
}

uv_errno!(UV_EACCES, libc::EACCES, -4092);
uv_errno!(UV_EADDRINUSE, libc::EADDRINUSE, -4091);
uv_errno!(UV_EAGAIN, libc::EAGAIN, -4088);
uv_errno!(UV_EALREADY, libc::EALREADY, -4084);
uv_errno!(UV_EBADF, libc::EBADF, -4083);
uv_errno!(UV_EBUSY, libc::EBUSY, -4082);
uv_errno!(UV_ECANCELED, libc::ECANCELED, -4081);
uv_errno!(UV_ECONNREFUSED, libc::ECONNREFUSED, -4078);
uv_errno!(UV_ECONNRESET, libc::ECONNRESET, -4077);
uv_errno!(UV_EHOSTUNREACH, libc::EHOSTUNREACH, -4065);
uv_errno!(UV_EINVAL, libc::EINVAL, -4071);
uv_errno!(UV_EIO, libc::EIO, -4070);
uv_errno!(UV_EISCONN, libc::EISCONN, -4035);
uv_errno!(UV_ENETUNREACH, libc::ENETUNREACH, -4062);
uv_errno!(UV_ENOENT, libc::ENOENT, -4058);
uv_errno!(UV_ENOMEM, libc::ENOMEM, -4057);
uv_errno!(UV_ENOSYS, libc::ENOSYS, -4054);
uv_errno!(UV_ENOTCONN, libc::ENOTCONN, -4053);
uv_errno!(UV_ENOTSUP, libc::ENOTSUP, -4049);
uv_errno!(UV_EPERM, libc::EPERM, -4048);
uv_errno!(UV_EPIPE, libc::EPIPE, -4047);
uv_errno!(UV_ESRCH, libc::ESRCH, -4040);
uv_errno!(UV_ETIMEDOUT, libc::ETIMEDOUT, -4039);
pub const UV_EOF: i32 = -4095;

const ERRNO_TABLE: &[(i32, &str, &str)] = &[
  (UV_EACCES, "EACCES", "permission denied"),
  (UV_EADDRINUSE, "EADDRINUSE", "address already in use"),
  (UV_EAGAIN, "EAGAIN", "resource temporarily unavailable"),
  (UV_EALREADY, "EALREADY", "connection already in progress"),
  (UV_EBADF, "EBADF", "bad file descriptor"),
  (UV_EBUSY, "EBUSY", "resource busy or locked"),
  (UV_ECANCELED, "ECANCELED", "operation canceled"),
  (UV_ECONNREFUSED, "ECONNREFUSED", "connection refused"),
  (UV_ECONNRESET, "ECONNRESET", "connection reset by peer"),
  (UV_EHOSTUNREACH, "EHOSTUNREACH", "host is unreachable"),
  (UV_EINVAL, "EINVAL", "invalid argument"),
  (UV_EIO, "EIO", "i/o error"),
  (UV_EISCONN, "EISCONN", "socket is already connected"),
  (UV_ENETUNREACH, "ENETUNREACH", "network is unreachable"),
  (UV_ENOENT, "ENOENT", "no such file or directory"),
  (UV_ENOMEM, "ENOMEM", "not enough memory"),
  (UV_ENOSYS, "ENOSYS", "function not implemented"),
  (UV_ENOTCONN, "ENOTCONN", "socket is not connected"),
  (UV_ENOTSUP, "ENOTSUP", "operation not supported on socket"),
  (UV_EPERM, "EPERM", "operation not permitted"),
  (UV_EPIPE, "EPIPE", "broken pipe"),
  (UV_ESRCH, "ESRCH", "no such process"),
  (UV_ETIMEDOUT, "ETIMEDOUT", "connection timed out"),
  (UV_EOF, "EOF", "end of file"),
];

/// Symbolic name of a native status code, e.g. `"ECONNREFUSED"`.
pub fn err_name(code: i32) -> &'static str {
  ERRNO_TABLE
    .iter()
    .find(|(c, _, _)| *c == code)
    .map(|(_, name, _)| *name)
    .unwrap_or("UNKNOWN")
}

/// Human readable message for a native status code.
pub fn strerror(code: i32) -> &'static str {
  ERRNO_TABLE
    .iter()
    .find(|(c, _, _)| *c == code)
    .map(|(_, _, msg)| *msg)
    .unwrap_or("unknown error")
}

/// Translates an I/O error coming out of std/tokio into a native status.
pub fn status_from_io(err: &std::io::Error) -> i32 {
  #[cfg(unix)]
  if let Some(errno) = err.raw_os_error() {
    return -errno;
  }
  use std::io::ErrorKind;
  match err.kind() {
    ErrorKind::NotFound => UV_ENOENT,
    ErrorKind::PermissionDenied => UV_EACCES,
    ErrorKind::ConnectionRefused => UV_ECONNREFUSED,
    ErrorKind::ConnectionReset => UV_ECONNRESET,
    ErrorKind::NotConnected => UV_ENOTCONN,
    ErrorKind::AddrInUse => UV_EADDRINUSE,
    ErrorKind::BrokenPipe => UV_EPIPE,
    ErrorKind::WouldBlock => UV_EAGAIN,
    ErrorKind::InvalidInput => UV_EINVAL,
    ErrorKind::TimedOut => UV_ETIMEDOUT,
    ErrorKind::OutOfMemory => UV_ENOMEM,
    ErrorKind::Unsupported => UV_ENOTSUP,
    _ => UV_EIO,
  }
}

/// Which subsystem produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
  /// A negative status from the native event loop.
  Native,
  /// Bad caller input, detected before any native call.
  Argument,
  /// The handle was used after it was closed.
  ResourceClosed,
  /// An allocation failed.
  OutOfMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UvError {
  #[error("{0}")]
  Argument(Cow<'static, str>),
  #[error("{}", native_message(.code, .context))]
  Native { code: i32, context: Option<String> },
  #[error("handle is closed")]
  ResourceClosed,
  /// Carries no payload so it can be produced when nothing else can be
  /// allocated.
  #[error("not enough memory")]
  OutOfMemory,
}

fn native_message(code: &i32, context: &Option<String>) -> String {
  match context {
    Some(context) => {
      format!("[{}] {} ({})", err_name(*code), strerror(*code), context)
    }
    None => format!("[{}] {}", err_name(*code), strerror(*code)),
  }
}

impl UvError {
  pub fn native(code: i32) -> Self {
    debug_assert!(code < 0, "native status {code} is not a failure");
    UvError::Native {
      code,
      context: None,
    }
  }

  /// Builds a native error decorated with a context string such as
  /// `"host:port"`. Falls back to [`UvError::OutOfMemory`] when the context
  /// cannot be allocated.
  pub fn native_with_context(code: i32, context: impl fmt::Display) -> Self {
    let mut buf = String::new();
    if buf.try_reserve(64).is_err() || write!(buf, "{context}").is_err() {
      return UvError::OutOfMemory;
    }
    UvError::Native {
      code,
      context: Some(buf),
    }
  }

  pub fn argument(message: impl Into<Cow<'static, str>>) -> Self {
    UvError::Argument(message.into())
  }

  pub fn domain(&self) -> ErrorDomain {
    match self {
      UvError::Native { .. } => ErrorDomain::Native,
      UvError::Argument(_) => ErrorDomain::Argument,
      UvError::ResourceClosed => ErrorDomain::ResourceClosed,
      UvError::OutOfMemory => ErrorDomain::OutOfMemory,
    }
  }

  /// The numeric status associated with this error. Non-native failures
  /// map onto the closest errno.
  pub fn code(&self) -> i32 {
    match self {
      UvError::Native { code, .. } => *code,
      UvError::Argument(_) => UV_EINVAL,
      UvError::ResourceClosed => UV_EBADF,
      UvError::OutOfMemory => UV_ENOMEM,
    }
  }

  pub fn name(&self) -> &'static str {
    err_name(self.code())
  }

  pub fn context(&self) -> Option<&str> {
    match self {
      UvError::Native { context, .. } => context.as_deref(),
      _ => None,
    }
  }

  pub fn is_eof(&self) -> bool {
    matches!(self, UvError::Native { code: UV_EOF, .. })
  }
}

impl From<std::io::Error> for UvError {
  fn from(err: std::io::Error) -> Self {
    if err.kind() == std::io::ErrorKind::OutOfMemory {
      return UvError::OutOfMemory;
    }
    UvError::native(status_from_io(&err))
  }
}

/// Converts a native status into a `Result`.
pub(crate) fn check_status(status: i32) -> Result<(), UvError> {
  if status < 0 {
    Err(UvError::native(status))
  } else {
    Ok(())
  }
}

/// How a failure reaches the caller of a synchronous operation. Snapshotted
/// from the loop onto every handle when the handle is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorMode {
  /// The failure is handed back as a value next to a `nil` result.
  #[default]
  Return,
  /// The failure aborts the current call into the runtime.
  Raise,
}

impl ErrorMode {
  /// Splits a result into its delivery channel: the outer `Err` aborts the
  /// call, the inner `Err` is handed back as a value.
  pub fn route<T>(
    self,
    result: Result<T, UvError>,
  ) -> Result<Result<T, UvError>, UvError> {
    match (self, result) {
      (_, Ok(value)) => Ok(Ok(value)),
      (ErrorMode::Return, Err(err)) => Ok(Err(err)),
      (ErrorMode::Raise, Err(err)) => Err(err),
    }
  }
}

/// A failure raised by a callback and not handled inside it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
  #[error("{0}")]
  Thrown(String),
  #[error(transparent)]
  Uv(#[from] UvError),
  #[error("not enough memory")]
  OutOfMemory,
}

impl CallbackError {
  pub fn thrown(message: impl Into<String>) -> Self {
    CallbackError::Thrown(message.into())
  }
}

/// Why [`crate::Loop::run`] gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
  #[error("uncaught error in callback: {0}")]
  Callback(CallbackError),
  #[error("not enough memory while reporting a callback error")]
  OutOfMemory,
  #[error(transparent)]
  Uv(#[from] UvError),
}

impl LoopError {
  pub(crate) fn from_callback(err: CallbackError) -> Self {
    match err {
      CallbackError::OutOfMemory => LoopError::OutOfMemory,
      CallbackError::Uv(UvError::OutOfMemory) => LoopError::OutOfMemory,
      other => LoopError::Callback(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  #[case(UV_ECONNREFUSED, "ECONNREFUSED")]
  #[case(UV_EINVAL, "EINVAL")]
  #[case(UV_EOF, "EOF")]
  #[case(UV_ECANCELED, "ECANCELED")]
  #[case(-99999, "UNKNOWN")]
  fn test_err_name(#[case] code: i32, #[case] name: &str) {
    assert_eq!(err_name(code), name);
  }

  #[test]
  fn test_native_error_display() {
    let err = UvError::native_with_context(UV_EINVAL, "nohost:80");
    assert_eq!(err.to_string(), "[EINVAL] invalid argument (nohost:80)");
    assert_eq!(err.context(), Some("nohost:80"));
    assert_eq!(err.domain(), ErrorDomain::Native);
    assert_eq!(err.code(), UV_EINVAL);
  }

  #[test]
  fn test_domains() {
    assert_eq!(UvError::argument("bad").domain(), ErrorDomain::Argument);
    assert_eq!(
      UvError::ResourceClosed.domain(),
      ErrorDomain::ResourceClosed
    );
    assert_eq!(UvError::OutOfMemory.domain(), ErrorDomain::OutOfMemory);
    assert_eq!(UvError::OutOfMemory.code(), UV_ENOMEM);
    assert!(UvError::native(UV_EOF).is_eof());
  }

  #[test]
  fn test_error_mode_route() {
    let failed: Result<u32, UvError> = Err(UvError::native(UV_EBUSY));
    let returned = ErrorMode::Return.route(failed.clone()).unwrap();
    assert_eq!(returned, Err(UvError::native(UV_EBUSY)));
    let raised = ErrorMode::Raise.route(failed).unwrap_err();
    assert_eq!(raised.code(), UV_EBUSY);
    assert_eq!(ErrorMode::Raise.route(Ok::<_, UvError>(7)), Ok(Ok(7)));
  }

  #[cfg(unix)]
  #[test]
  fn test_status_from_io() {
    let err = std::io::Error::from_raw_os_error(libc::ECONNREFUSED);
    assert_eq!(status_from_io(&err), UV_ECONNREFUSED);
    let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    assert_eq!(status_from_io(&err), UV_ENOENT);
  }

  #[test]
  fn test_loop_error_from_callback() {
    assert_eq!(
      LoopError::from_callback(CallbackError::OutOfMemory),
      LoopError::OutOfMemory
    );
    assert!(matches!(
      LoopError::from_callback(CallbackError::thrown("boom")),
      LoopError::Callback(CallbackError::Thrown(_))
    ));
  }
}
