// Copyright 2018-2025 the Deno authors. MIT license.
use super::Recorder;
use super::setup;
use super::this;
use super::watchdog;
use crate::error::CallbackError;
use crate::error::UV_ECONNREFUSED;
use crate::error::UV_EINVAL;
use crate::error::UV_ENOTCONN;
use crate::error::UvError;
use crate::event_loop::Loop;
use crate::event_loop::RunMode;
use crate::event_loop::RunStatus;
use crate::handle::Idle;
use crate::handle::Tcp;
use crate::handle::Timer;
use crate::value::Value;
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// A local port nothing is listening on.
fn closed_port() -> u16 {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}

fn error_code(args: &[Value]) -> Option<i32> {
  args.get(1).and_then(Value::as_error).map(UvError::code)
}

#[test]
fn test_write_before_connect_fails_synchronously() {
  let event_loop = setup();
  let tcp = Tcp::new(&event_loop).unwrap();
  let err = tcp
    .write("hello", |_| panic!("write callback must not run"))
    .unwrap_err();
  assert_eq!(err.code(), UV_ENOTCONN);
  let err = tcp
    .shutdown(|_| panic!("shutdown callback must not run"))
    .unwrap_err();
  assert_eq!(err.code(), UV_ENOTCONN);
  assert_eq!(event_loop.request_count(), 0);
  assert_eq!(event_loop.callback_count(), 0);
  assert!(tcp.is_open());
}

#[test]
fn test_bad_address_carries_context() {
  let event_loop = setup();
  let tcp = Tcp::new(&event_loop).unwrap();
  let err = tcp
    .connect("not-an-ip", 80, |_| panic!("connect callback must not run"))
    .unwrap_err();
  assert_eq!(err.code(), UV_EINVAL);
  assert_eq!(err.context(), Some("not-an-ip:80"));
  assert_eq!(event_loop.callback_count(), 0);
  assert_eq!(event_loop.request_count(), 0);
}

#[test]
fn test_connect_refused() {
  let event_loop = setup();
  let _watchdog = watchdog(&event_loop, 5_000);
  let port = closed_port();
  let tcp = Tcp::new(&event_loop).unwrap();
  let statuses = Recorder::default();
  let statuses_ = statuses.clone();
  tcp
    .connect("127.0.0.1", port, move |args| {
      statuses_.push(error_code(args));
      Ok(())
    })
    .unwrap();
  assert_eq!(event_loop.request_count(), 1);
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(statuses.get(), vec![Some(UV_ECONNREFUSED)]);
  assert_eq!(event_loop.request_count(), 0);
  // Only the watchdog's callback is left.
  assert_eq!(event_loop.callback_count(), 1);
}

#[test]
fn test_close_cancels_outstanding_connect() {
  let event_loop = setup();
  let tcp = Tcp::new(&event_loop).unwrap();
  tcp
    .connect("127.0.0.1", closed_port(), |_| {
      panic!("connect callback of a closed handle must not run")
    })
    .unwrap();
  tcp.close().unwrap();
  assert_eq!(event_loop.request_count(), 1);
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(event_loop.request_count(), 0);
  assert_eq!(event_loop.callback_count(), 0);
  assert_eq!(event_loop.handle_count(), 0);
}

#[test]
fn test_echo() {
  let event_loop = setup();
  let _watchdog = watchdog(&event_loop, 5_000);

  let server = Tcp::new(&event_loop).unwrap();
  server.bind("127.0.0.1", 0).unwrap();
  let connections: Rc<RefCell<Vec<Tcp>>> = Rc::default();
  let connections_ = connections.clone();
  server
    .listen(16, move |args| {
      let conn = Tcp::try_from(this(args))?.accept()?;
      conn.read_start(|args| {
        let conn = Tcp::try_from(this(args))?;
        match args[1].as_error() {
          Some(err) if err.is_eof() => conn.close()?,
          Some(err) => return Err(err.clone().into()),
          None => {
            let data = args[2].as_bytes().cloned().unwrap_or_default();
            conn.write(data, |_| Ok(()))?;
          }
        }
        Ok(())
      })?;
      connections_.borrow_mut().push(conn);
      Ok(())
    })
    .unwrap();
  let address = server.sockname().unwrap();
  assert_eq!(address.host, "127.0.0.1");
  assert_ne!(address.port, 0);

  let client = Tcp::new(&event_loop).unwrap();
  let received = Rc::new(RefCell::new(Vec::<u8>::new()));
  let writes = Recorder::default();
  let received_ = received.clone();
  let writes_ = writes.clone();
  let server_ = server.clone();
  client
    .connect("127.0.0.1", address.port, move |args| {
      if let Some(err) = args[1].as_error() {
        return Err(err.clone().into());
      }
      let client = Tcp::try_from(this(args))?;
      client.nodelay(true)?;
      let writes = writes_.clone();
      client.write("hello", move |args| {
        writes.push(error_code(args));
        Ok(())
      })?;
      let received = received_.clone();
      let server = server_.clone();
      client.read_start(move |args| {
        if let Some(data) = args.get(2).and_then(Value::as_bytes) {
          received.borrow_mut().extend_from_slice(data);
        }
        if received.borrow().len() >= 5 {
          Tcp::try_from(this(args))?.close()?;
          server.close()?;
        }
        Ok(())
      })?;
      Ok(())
    })
    .unwrap();

  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(received.borrow().as_slice(), b"hello");
  assert_eq!(writes.get(), vec![None]);
  assert_eq!(connections.borrow().len(), 1);
  assert!(!connections.borrow()[0].is_open());
  assert_eq!(event_loop.request_count(), 0);
}

/// A listening server on an ephemeral local port that accepts every
/// connection and starts reading it with `on_read`.
fn accepting_server(
  event_loop: &Loop,
  on_read: impl Fn(&[Value]) -> Result<(), CallbackError> + Clone + 'static,
) -> (Tcp, u16, Rc<RefCell<Vec<Tcp>>>) {
  let server = Tcp::new(event_loop).unwrap();
  server.bind("127.0.0.1", 0).unwrap();
  let accepted: Rc<RefCell<Vec<Tcp>>> = Rc::default();
  let accepted_ = accepted.clone();
  server
    .listen(16, move |args| {
      let conn = Tcp::try_from(this(args))?.accept()?;
      conn.read_start(on_read.clone())?;
      accepted_.borrow_mut().push(conn);
      Ok(())
    })
    .unwrap();
  let port = server.sockname().unwrap().port;
  (server, port, accepted)
}

#[test]
fn test_close_while_data_is_pending_drops_the_read() {
  let event_loop = setup();
  let _watchdog = watchdog(&event_loop, 5_000);
  let reads = Recorder::default();
  let reads_ = reads.clone();
  let (server, port, accepted) = accepting_server(&event_loop, move |args| {
    reads_.push(args.len());
    Ok(())
  });
  let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
  client.write_all(b"pending").unwrap();

  // Accepting starts the read; the bytes are picked up on a later iteration.
  while accepted.borrow().is_empty() {
    event_loop.run(RunMode::Once).unwrap();
  }
  assert_eq!(reads.get(), Vec::<usize>::new());

  let conn = accepted.borrow()[0].clone();
  let closer = Timer::new(&event_loop).unwrap();
  closer
    .start(0, 0, move |_| {
      conn.close()?;
      Ok(())
    })
    .unwrap();
  let handles = event_loop.handle_count();
  event_loop.run(RunMode::Once).unwrap();
  assert_eq!(reads.get(), Vec::<usize>::new());
  assert_eq!(event_loop.handle_count(), handles - 1);

  server.close().unwrap();
  closer.close().unwrap();
  event_loop.run(RunMode::Default).unwrap();
  assert_eq!(reads.get(), Vec::<usize>::new());
}

#[test]
fn test_each_connection_reads_its_own_bytes() {
  let event_loop = setup();
  let _watchdog = watchdog(&event_loop, 5_000);
  let reads = Recorder::default();
  let reads_ = reads.clone();
  let (server, port, accepted) = accepting_server(&event_loop, move |args| {
    let conn = Tcp::try_from(this(args))?;
    let Some(data) = args.get(2).and_then(Value::as_bytes) else {
      conn.close()?;
      return Ok(());
    };
    // The shared buffer is busy for as long as a read callback runs.
    let extra = conn.event_loop().alloc_buffer(data.len())?;
    let shared = extra.is_shared();
    conn.event_loop().release_buffer(extra);
    reads_.push((data.to_vec(), shared));
    Ok(())
  });
  let mut first = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
  let mut second = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
  first.write_all(b"first").unwrap();
  second.write_all(b"second").unwrap();
  drop((first, second));

  let server_ = server.clone();
  let closer = Idle::new(&event_loop).unwrap();
  closer
    .start(move |args| {
      if accepted.borrow().len() == 2
        && accepted.borrow().iter().all(|conn| !conn.is_open())
      {
        server_.close()?;
        Idle::try_from(this(args))?.close()?;
      }
      Ok(())
    })
    .unwrap();
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));

  let mut reads = reads.get();
  reads.sort();
  assert_eq!(
    reads,
    vec![(b"first".to_vec(), false), (b"second".to_vec(), false)]
  );
  // Both reads handed the shared buffer back.
  assert!(event_loop.alloc_buffer(1).unwrap().is_shared());
}

#[cfg(target_os = "linux")]
#[test]
fn test_accept_failure_reaches_connection_callback() {
  let event_loop = setup();
  let _watchdog = watchdog(&event_loop, 5_000);
  let server = Tcp::new(&event_loop).unwrap();
  server.bind("127.0.0.1", 0).unwrap();
  let statuses = Recorder::default();
  let statuses_ = statuses.clone();
  server
    .listen(1, move |args| {
      statuses_.push(error_code(args));
      Tcp::try_from(this(args))?.close()?;
      Ok(())
    })
    .unwrap();
  let fd = event_loop
    .with_native(|native| native.tcp_raw_fd(server.id()))
    .unwrap();
  // A listener that has been shut down fails every accept with EINVAL.
  // SAFETY: `fd` is the server's open listening socket.
  assert_eq!(unsafe { libc::shutdown(fd, libc::SHUT_RDWR) }, 0);

  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(statuses.get(), vec![Some(UV_EINVAL)]);
}
