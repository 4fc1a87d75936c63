// Copyright 2018-2025 the Deno authors. MIT license.
use super::NativeId;
use super::NativeLoop;
use super::NativeObject;
use crate::error::UV_EAGAIN;
use crate::error::UV_EALREADY;
use crate::error::UV_ECANCELED;
use crate::error::UV_EINVAL;
use crate::error::UV_EISCONN;
use crate::error::UV_ENOTCONN;
use crate::error::UV_EPIPE;
use crate::error::status_from_io;
use crate::handle::HandleKind;
use crate::request::RequestId;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;

/// In-flight connect. Consumed when the connect completes or the handle is
/// closed.
struct ConnectPending {
  req: RequestId,
  future: LocalBoxFuture<'static, io::Result<TcpStream>>,
}

/// Queued write waiting for the socket to become writable.
struct WritePending {
  req: RequestId,
  data: Bytes,
  offset: usize,
}

#[derive(Default)]
pub(crate) struct TcpState {
  bind_addr: Option<SocketAddr>,
  stream: Option<TcpStream>,
  listener: Option<TcpListener>,
  nodelay: bool,
  reading: bool,
  connect: Option<ConnectPending>,
  writes: VecDeque<WritePending>,
  shutdown: Option<RequestId>,
  backlog: VecDeque<TcpStream>,
}

impl TcpState {
  pub(crate) fn is_active(&self) -> bool {
    self.reading
      || self.listener.is_some()
      || self.connect.is_some()
      || !self.writes.is_empty()
      || self.shutdown.is_some()
  }

  /// Fails every outstanding request with `ECANCELED` and drops the socket.
  pub(crate) fn cancel_all(&mut self, out: &mut VecDeque<(RequestId, i32)>) {
    if let Some(pending) = self.connect.take() {
      out.push_back((pending.req, UV_ECANCELED));
    }
    for pending in self.writes.drain(..) {
      out.push_back((pending.req, UV_ECANCELED));
    }
    if let Some(req) = self.shutdown.take() {
      out.push_back((req, UV_ECANCELED));
    }
    self.reading = false;
    self.stream = None;
    self.listener = None;
    self.backlog.clear();
  }
}

pub(crate) enum ReadOutcome {
  Data(usize),
  Eof,
  WouldBlock,
  Failed(i32),
}

fn listen_on(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
  let socket = match addr {
    SocketAddr::V4(_) => TcpSocket::new_v4()?,
    SocketAddr::V6(_) => TcpSocket::new_v6()?,
  };
  #[cfg(unix)]
  socket.set_reuseaddr(true)?;
  socket.bind(addr)?;
  socket.listen(backlog)
}

impl NativeLoop {
  fn tcp_mut(&mut self, id: NativeId) -> Option<&mut TcpState> {
    match self.object_mut(id)? {
      NativeObject::Tcp(tcp) => Some(&mut **tcp),
      _ => None,
    }
  }

  fn tcp(&self, id: NativeId) -> Option<&TcpState> {
    match self.slots.get(&id).filter(|s| !s.closing).map(|s| &s.object) {
      Some(NativeObject::Tcp(tcp)) => Some(&**tcp),
      _ => None,
    }
  }

  pub(crate) fn tcp_init(&mut self, id: NativeId) -> i32 {
    self.init_object(
      id,
      HandleKind::Tcp,
      NativeObject::Tcp(Box::default()),
    )
  }

  pub(crate) fn tcp_bind(&mut self, id: NativeId, addr: SocketAddr) -> i32 {
    let Some(tcp) = self.tcp_mut(id) else {
      return UV_EINVAL;
    };
    if tcp.stream.is_some() || tcp.listener.is_some() || tcp.connect.is_some()
    {
      return UV_EINVAL;
    }
    tcp.bind_addr = Some(addr);
    0
  }

  pub(crate) fn tcp_connect(
    &mut self,
    id: NativeId,
    req: RequestId,
    addr: SocketAddr,
  ) -> i32 {
    let Some(tcp) = self.tcp_mut(id) else {
      return UV_EINVAL;
    };
    if tcp.stream.is_some() {
      return UV_EISCONN;
    }
    if tcp.connect.is_some() {
      return UV_EALREADY;
    }
    if tcp.listener.is_some() {
      return UV_EINVAL;
    }
    let socket = match addr {
      SocketAddr::V4(_) => TcpSocket::new_v4(),
      SocketAddr::V6(_) => TcpSocket::new_v6(),
    };
    let socket = match socket {
      Ok(socket) => socket,
      Err(err) => return status_from_io(&err),
    };
    if let Some(bind_addr) = tcp.bind_addr
      && let Err(err) = socket.bind(bind_addr)
    {
      return status_from_io(&err);
    }
    tcp.connect = Some(ConnectPending {
      req,
      future: socket.connect(addr).boxed_local(),
    });
    self.waker.wake_by_ref();
    0
  }

  /// Must run inside the loop's runtime context.
  pub(crate) fn tcp_listen(&mut self, id: NativeId, backlog: u32) -> i32 {
    let Some(tcp) = self.tcp_mut(id) else {
      return UV_EINVAL;
    };
    if tcp.listener.is_some() {
      return 0;
    }
    if tcp.stream.is_some() || tcp.connect.is_some() {
      return UV_EINVAL;
    }
    let bind_addr = tcp
      .bind_addr
      .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    match listen_on(bind_addr, backlog) {
      Ok(listener) => tcp.listener = Some(listener),
      Err(err) => return status_from_io(&err),
    }
    self.waker.wake_by_ref();
    0
  }

  pub(crate) fn tcp_accept(
    &mut self,
    server: NativeId,
    client: NativeId,
  ) -> i32 {
    let Some(stream) = self
      .tcp_mut(server)
      .and_then(|server| server.backlog.pop_front())
    else {
      return UV_EAGAIN;
    };
    let Some(client) = self.tcp_mut(client) else {
      return UV_EINVAL;
    };
    if client.nodelay {
      stream.set_nodelay(true).ok();
    }
    client.stream = Some(stream);
    0
  }

  pub(crate) fn tcp_read_start(&mut self, id: NativeId) -> i32 {
    match self.tcp_mut(id) {
      Some(tcp) if tcp.stream.is_some() => tcp.reading = true,
      Some(_) => return UV_ENOTCONN,
      None => return UV_EINVAL,
    }
    self.waker.wake_by_ref();
    0
  }

  pub(crate) fn tcp_read_stop(&mut self, id: NativeId) -> i32 {
    match self.tcp_mut(id) {
      Some(tcp) => {
        tcp.reading = false;
        0
      }
      None => UV_EINVAL,
    }
  }

  pub(crate) fn tcp_write(
    &mut self,
    id: NativeId,
    req: RequestId,
    data: Bytes,
  ) -> i32 {
    let Some(tcp) = self.tcp_mut(id) else {
      return UV_EINVAL;
    };
    if tcp.stream.is_none() && tcp.connect.is_none() {
      return UV_ENOTCONN;
    }
    if tcp.shutdown.is_some() {
      return UV_EPIPE;
    }
    tcp.writes.push_back(WritePending {
      req,
      data,
      offset: 0,
    });
    self.waker.wake_by_ref();
    0
  }

  pub(crate) fn tcp_shutdown(&mut self, id: NativeId, req: RequestId) -> i32 {
    let Some(tcp) = self.tcp_mut(id) else {
      return UV_EINVAL;
    };
    if tcp.stream.is_none() && tcp.connect.is_none() {
      return UV_ENOTCONN;
    }
    if tcp.shutdown.is_some() {
      return UV_EALREADY;
    }
    tcp.shutdown = Some(req);
    self.waker.wake_by_ref();
    0
  }

  pub(crate) fn tcp_nodelay(&mut self, id: NativeId, enable: bool) -> i32 {
    let Some(tcp) = self.tcp_mut(id) else {
      return UV_EINVAL;
    };
    tcp.nodelay = enable;
    match &tcp.stream {
      Some(stream) => match stream.set_nodelay(enable) {
        Ok(()) => 0,
        Err(err) => status_from_io(&err),
      },
      None => 0,
    }
  }

  pub(crate) fn tcp_sockname(&self, id: NativeId) -> Result<SocketAddr, i32> {
    let tcp = self.tcp(id).ok_or(UV_EINVAL)?;
    if let Some(stream) = &tcp.stream {
      return stream.local_addr().map_err(|e| status_from_io(&e));
    }
    if let Some(listener) = &tcp.listener {
      return listener.local_addr().map_err(|e| status_from_io(&e));
    }
    tcp.bind_addr.ok_or(UV_EINVAL)
  }

  pub(crate) fn tcp_peername(&self, id: NativeId) -> Result<SocketAddr, i32> {
    let tcp = self.tcp(id).ok_or(UV_EINVAL)?;
    match &tcp.stream {
      Some(stream) => stream.peer_addr().map_err(|e| status_from_io(&e)),
      None => Err(UV_ENOTCONN),
    }
  }

  /// The descriptor of the connected stream, or of the listener.
  #[cfg(unix)]
  pub(crate) fn tcp_raw_fd(&self, id: NativeId) -> Option<std::os::fd::RawFd> {
    use std::os::fd::AsRawFd;
    let tcp = self.tcp(id)?;
    match (&tcp.stream, &tcp.listener) {
      (Some(stream), _) => Some(stream.as_raw_fd()),
      (None, Some(listener)) => Some(listener.as_raw_fd()),
      (None, None) => None,
    }
  }

  /// TCP handles with anything to poll.
  pub(crate) fn tcp_ids(&self) -> Vec<NativeId> {
    self
      .slots
      .iter()
      .filter(|(_, slot)| slot.is_active())
      .filter(|(_, slot)| matches!(slot.object, NativeObject::Tcp(_)))
      .map(|(id, _)| *id)
      .collect()
  }

  pub(crate) fn poll_connect(
    &mut self,
    id: NativeId,
    cx: &mut Context,
  ) -> Option<(RequestId, i32)> {
    let tcp = self.tcp_mut(id)?;
    let pending = tcp.connect.as_mut()?;
    let Poll::Ready(result) = pending.future.as_mut().poll(cx) else {
      return None;
    };
    let req = pending.req;
    tcp.connect = None;
    let status = match result {
      Ok(stream) => {
        if tcp.nodelay {
          stream.set_nodelay(true).ok();
        }
        tcp.stream = Some(stream);
        0
      }
      Err(err) => status_from_io(&err),
    };
    Some((req, status))
  }

  /// Moves freshly accepted connections into the backlog. Returns how many
  /// are waiting, and the status of a failed accept.
  pub(crate) fn poll_accept(
    &mut self,
    id: NativeId,
    cx: &mut Context,
  ) -> (usize, Option<i32>) {
    let Some(tcp) = self.tcp_mut(id) else {
      return (0, None);
    };
    let mut failed = None;
    if let Some(listener) = &tcp.listener {
      loop {
        match listener.poll_accept(cx) {
          Poll::Ready(Ok((stream, _))) => tcp.backlog.push_back(stream),
          Poll::Ready(Err(err)) => {
            failed = Some(status_from_io(&err));
            // Nothing was registered; try again next iteration.
            cx.waker().wake_by_ref();
            break;
          }
          Poll::Pending => break,
        }
      }
    }
    (tcp.backlog.len(), failed)
  }

  pub(crate) fn backlog_len(&self, id: NativeId) -> usize {
    self.tcp(id).map_or(0, |tcp| tcp.backlog.len())
  }

  /// Registers read interest. Returns whether the handle wants data.
  pub(crate) fn poll_read_ready(
    &mut self,
    id: NativeId,
    cx: &mut Context,
  ) -> bool {
    let Some(tcp) = self.tcp_mut(id) else {
      return false;
    };
    match &tcp.stream {
      Some(stream) if tcp.reading => {
        let _ = stream.poll_read_ready(cx);
        true
      }
      _ => false,
    }
  }

  /// Reads into `buf`. When the socket would block, `cx` is registered for
  /// the next readiness.
  pub(crate) fn tcp_try_read(
    &mut self,
    id: NativeId,
    buf: &mut [u8],
    cx: &mut Context,
  ) -> ReadOutcome {
    let Some(stream) = self.tcp_mut(id).and_then(|tcp| tcp.stream.as_ref())
    else {
      return ReadOutcome::WouldBlock;
    };
    match stream.try_read(buf) {
      Ok(0) => ReadOutcome::Eof,
      Ok(n) => ReadOutcome::Data(n),
      Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
        if stream.poll_read_ready(cx).is_ready() {
          cx.waker().wake_by_ref();
        }
        ReadOutcome::WouldBlock
      }
      Err(err) => ReadOutcome::Failed(status_from_io(&err)),
    }
  }

  /// Drains the write queue in order, then performs a pending shutdown once
  /// every write has gone out.
  pub(crate) fn poll_writes(
    &mut self,
    id: NativeId,
    cx: &mut Context,
  ) -> SmallVec<[(RequestId, i32); 4]> {
    let mut done = SmallVec::new();
    let Some(tcp) = self.tcp_mut(id) else {
      return done;
    };
    let Some(stream) = tcp.stream.as_mut() else {
      return done;
    };
    if !tcp.writes.is_empty() {
      let _ = stream.poll_write_ready(cx);
    }
    while let Some(pw) = tcp.writes.front_mut() {
      let mut status = None;
      loop {
        if pw.offset >= pw.data.len() {
          status = Some(0);
          break;
        }
        match stream.try_write(&pw.data[pw.offset..]) {
          Ok(n) => pw.offset += n,
          Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            if stream.poll_write_ready(cx).is_ready() {
              cx.waker().wake_by_ref();
            }
            break;
          }
          Err(err) => {
            status = Some(status_from_io(&err));
            break;
          }
        }
      }
      let Some(status) = status else {
        // Retry on the next tick.
        break;
      };
      let req = pw.req;
      tcp.writes.pop_front();
      done.push((req, status));
    }
    if tcp.writes.is_empty()
      && let Some(req) = tcp.shutdown
    {
      match Pin::new(stream).poll_shutdown(cx) {
        Poll::Ready(result) => {
          tcp.shutdown = None;
          done.push((req, result.err().map_or(0, |e| status_from_io(&e))));
        }
        Poll::Pending => {}
      }
    }
    done
  }
}
