// Copyright 2018-2025 the Deno authors. MIT license.
use super::CallbackSlot;
use super::Handle;
use super::HandleKind;
use crate::error::CallbackError;
use crate::error::UV_EINVAL;
use crate::error::UvError;
use crate::event_loop::Loop;
use crate::request::Request;
use crate::request::RequestKind;
use crate::value::Value;
use bytes::Bytes;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV6;
use std::ops::Deref;
use std::rc::Rc;

/// Parses `host` as IPv4 first and falls back to IPv6.
pub(crate) fn to_addr(host: &str, port: u16) -> Result<SocketAddr, i32> {
  if let Ok(ip) = host.parse::<Ipv4Addr>() {
    return Ok(SocketAddr::new(IpAddr::V4(ip), port));
  }
  if let Ok(ip) = host.parse::<Ipv6Addr>() {
    return Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)));
  }
  Err(UV_EINVAL)
}

/// A socket address in the shape handed to the runtime: host and port, plus
/// flow info and scope id for IPv6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
  pub host: String,
  pub port: u16,
  pub flowinfo: Option<u32>,
  pub scope_id: Option<u32>,
}

impl From<SocketAddr> for SocketAddress {
  fn from(addr: SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(v4) => SocketAddress {
        host: v4.ip().to_string(),
        port: v4.port(),
        flowinfo: None,
        scope_id: None,
      },
      SocketAddr::V6(v6) => SocketAddress {
        host: v6.ip().to_string(),
        port: v6.port(),
        flowinfo: Some(v6.flowinfo()),
        scope_id: Some(v6.scope_id()),
      },
    }
  }
}

impl SocketAddress {
  pub fn into_values(self) -> Vec<Value> {
    let mut values = vec![
      Value::String(self.host),
      Value::Integer(i64::from(self.port)),
    ];
    if let (Some(flowinfo), Some(scope_id)) = (self.flowinfo, self.scope_id) {
      values.push(Value::Integer(i64::from(flowinfo)));
      values.push(Value::Integer(i64::from(scope_id)));
    }
    values
  }
}

/// A TCP stream or listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tcp(Handle);

impl Tcp {
  pub fn new(event_loop: &Loop) -> Result<Tcp, UvError> {
    Handle::create(event_loop, HandleKind::Tcp)?
      .init(|native, id| native.tcp_init(id))
      .map(Tcp)
  }

  pub fn bind(&self, host: &str, port: u16) -> Result<(), UvError> {
    self.check_open()?;
    let addr = to_addr(host, port).map_err(|code| {
      UvError::native_with_context(code, format_args!("{host}:{port}"))
    })?;
    self.0.native_call(|native, id| native.tcp_bind(id, addr))
  }

  /// Starts connecting to `host:port`. `callback` receives the handle and
  /// `nil` or the connect error. It does not run if the handle is closed
  /// first, or if this call fails.
  pub fn connect(
    &self,
    host: &str,
    port: u16,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.check_open()?;
    let addr = to_addr(host, port).map_err(|code| {
      UvError::native_with_context(code, format_args!("{host}:{port}"))
    })?;
    let request =
      Request::new(&self.0, RequestKind::Connect, Rc::new(callback));
    let id = self.id();
    match request.issue(|native, req| native.tcp_connect(id, req, addr)) {
      Ok(_) => Ok(()),
      Err((request, status)) => {
        request.discard();
        Err(UvError::native_with_context(
          status,
          format_args!("{host}:{port}"),
        ))
      }
    }
  }

  /// Listens for connections. `callback` receives the handle and `nil` or an
  /// error, and is expected to call [`Tcp::accept`].
  pub fn listen(
    &self,
    backlog: u32,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    let _guard = self.event_loop().enter();
    self.0.start(
      CallbackSlot::Connection,
      Rc::new(callback),
      |native, id| native.tcp_listen(id, backlog),
    )
  }

  /// Accepts a pending connection into a new handle.
  pub fn accept(&self) -> Result<Tcp, UvError> {
    self.check_open()?;
    let server_id = self.id();
    Handle::create(self.event_loop(), HandleKind::Tcp)?
      .init(|native, client_id| match native.tcp_init(client_id) {
        0 => native.tcp_accept(server_id, client_id),
        status => status,
      })
      .map(Tcp)
  }

  /// Starts reading. `callback` receives `(handle, nil, data)` for each chunk
  /// and `(handle, error)` on failure; end of stream is the `EOF` error.
  pub fn read_start(
    &self,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.0.start(CallbackSlot::Read, Rc::new(callback), |native, id| {
      native.tcp_read_start(id)
    })
  }

  pub fn read_stop(&self) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.tcp_read_stop(id))
  }

  /// Queues `data` for writing. Writes complete in the order they were
  /// queued.
  pub fn write(
    &self,
    data: impl Into<Bytes>,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.check_open()?;
    let data = data.into();
    let request = Request::new(&self.0, RequestKind::Write, Rc::new(callback));
    let id = self.id();
    match request.issue(|native, req| native.tcp_write(id, req, data)) {
      Ok(_) => Ok(()),
      Err((request, status)) => {
        request.discard();
        Err(UvError::native(status))
      }
    }
  }

  /// Shuts down the write side once all queued writes are done.
  pub fn shutdown(
    &self,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    self.check_open()?;
    let request =
      Request::new(&self.0, RequestKind::Shutdown, Rc::new(callback));
    let id = self.id();
    match request.issue(|native, req| native.tcp_shutdown(id, req)) {
      Ok(_) => Ok(()),
      Err((request, status)) => {
        request.discard();
        Err(UvError::native(status))
      }
    }
  }

  pub fn nodelay(&self, enable: bool) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.tcp_nodelay(id, enable))
  }

  pub fn sockname(&self) -> Result<SocketAddress, UvError> {
    self
      .0
      .native_query(|native, id| native.tcp_sockname(id))?
      .map(SocketAddress::from)
      .map_err(UvError::native)
  }

  pub fn peername(&self) -> Result<SocketAddress, UvError> {
    self
      .0
      .native_query(|native, id| native.tcp_peername(id))?
      .map(SocketAddress::from)
      .map_err(UvError::native)
  }
}

impl Deref for Tcp {
  type Target = Handle;

  fn deref(&self) -> &Handle {
    &self.0
  }
}

impl From<Tcp> for Handle {
  fn from(tcp: Tcp) -> Handle {
    tcp.0
  }
}

impl TryFrom<Handle> for Tcp {
  type Error = UvError;

  fn try_from(handle: Handle) -> Result<Self, Self::Error> {
    match handle.kind() {
      HandleKind::Tcp => Ok(Tcp(handle)),
      kind => Err(UvError::argument(format!("tcp expected, got {kind}"))),
    }
  }
}
