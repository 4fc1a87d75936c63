// Copyright 2018-2025 the Deno authors. MIT license.
use super::NativeId;
use super::NativeLoop;
use super::NativeObject;
use crate::error::UV_EINVAL;
use crate::error::UV_ESRCH;
use crate::error::status_from_io;
use crate::handle::HandleKind;
use std::io;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::task::Context;

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
// Pipes are only ever created on unix.
#[cfg(not(unix))]
type UnixStream = std::convert::Infallible;

/// Where one of the child's descriptors is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StdioTarget {
  Ignore,
  Inherit,
  /// A duplicate of this descriptor is handed to the child.
  Fd(i32),
  /// A new pipe. `readable` and `writable` are from the child's point of
  /// view; neither or both make it duplex.
  Pipe { readable: bool, writable: bool },
}

/// Fully resolved spawn parameters.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpawnSpec {
  pub(crate) file: String,
  pub(crate) argv: Vec<String>,
  pub(crate) env: Option<Vec<(String, String)>>,
  pub(crate) cwd: Option<PathBuf>,
  pub(crate) uid: Option<u32>,
  pub(crate) gid: Option<u32>,
  pub(crate) detached: bool,
  pub(crate) stdio: Vec<StdioTarget>,
}

/// Parent end of a pipe created for one of the child's descriptors.
#[derive(Debug)]
pub enum ChildPipe {
  /// The child reads what the parent writes here.
  Writer(UnixStream),
  /// The parent reads what the child writes.
  Reader(UnixStream),
  Duplex(UnixStream),
}

#[derive(Debug, Default)]
pub(crate) struct ProcessState {
  child: Option<Child>,
  pid: u32,
  exited: bool,
  pipes: Vec<Option<ChildPipe>>,
}

impl ProcessState {
  pub(crate) fn is_running(&self) -> bool {
    self.child.is_some() && !self.exited
  }

  /// Gives up ownership of a child that is still running so it can be reaped
  /// later.
  pub(crate) fn release_child(&mut self) -> Option<Child> {
    if self.exited {
      return None;
    }
    self.child.take()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessExit {
  pub(crate) id: NativeId,
  pub(crate) exit_status: i64,
  pub(crate) term_signal: i32,
}

/// Everything a spawn needs besides the `Command` itself.
#[derive(Default)]
struct Wiring {
  pipes: Vec<Option<ChildPipe>>,
  /// Child ends of descriptors above stderr. They must stay open until the
  /// child has been forked.
  #[cfg(unix)]
  _child_ends: Vec<OwnedFd>,
  /// `(source, target)` pairs for descriptors above stderr.
  #[cfg(unix)]
  extra: Vec<(RawFd, RawFd)>,
}

/// Duplicates `fd` into a new close-on-exec descriptor of at least `min`.
#[cfg(unix)]
fn dup_cloexec(fd: RawFd, min: RawFd) -> io::Result<OwnedFd> {
  use std::os::fd::FromRawFd;
  // SAFETY: fcntl either fails or returns a fresh descriptor we own.
  let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) };
  if dup < 0 {
    return Err(io::Error::last_os_error());
  }
  // SAFETY: `dup` is a valid descriptor not owned by anything else.
  Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Creates a socket pair and closes the directions `readable`/`writable`
/// rule out. Returns the parent's end and the child's end.
#[cfg(unix)]
fn child_pipe(
  readable: bool,
  writable: bool,
) -> io::Result<(ChildPipe, UnixStream)> {
  use std::net::Shutdown;
  let (parent, child) = UnixStream::pair()?;
  let pipe = match (readable, writable) {
    (true, false) => {
      parent.shutdown(Shutdown::Read)?;
      child.shutdown(Shutdown::Write)?;
      ChildPipe::Writer(parent)
    }
    (false, true) => {
      parent.shutdown(Shutdown::Write)?;
      child.shutdown(Shutdown::Read)?;
      ChildPipe::Reader(parent)
    }
    _ => ChildPipe::Duplex(parent),
  };
  Ok((pipe, child))
}

#[cfg(unix)]
fn wire_stdio(command: &mut Command, spec: &SpawnSpec) -> io::Result<Wiring> {
  let mut wiring = Wiring::default();
  let count = spec.stdio.len().max(3);
  for index in 0..count {
    let target = spec.stdio.get(index).copied();
    let target = target.unwrap_or(StdioTarget::Ignore);
    let fd = index as RawFd;
    let mut pipe = None;
    let child_end: Option<OwnedFd> = match target {
      StdioTarget::Ignore if index < 3 => {
        set_stdio(command, index, Stdio::null());
        None
      }
      StdioTarget::Ignore => None,
      StdioTarget::Inherit if index < 3 => {
        set_stdio(command, index, Stdio::inherit());
        None
      }
      StdioTarget::Inherit => Some(dup_cloexec(fd, 3)?),
      StdioTarget::Fd(source) => Some(dup_cloexec(source, 3)?),
      StdioTarget::Pipe { readable, writable } => {
        let (parent, child) = child_pipe(readable, writable)?;
        pipe = Some(parent);
        Some(OwnedFd::from(child))
      }
    };
    wiring.pipes.push(pipe);
    let Some(child_end) = child_end else {
      continue;
    };
    if index < 3 {
      set_stdio(command, index, Stdio::from(child_end));
    } else {
      use std::os::fd::AsRawFd;
      wiring.extra.push((child_end.as_raw_fd(), fd));
      wiring._child_ends.push(child_end);
    }
  }
  if !wiring.extra.is_empty() {
    use std::os::unix::process::CommandExt;
    let mut extra = wiring.extra.clone();
    let highest = extra.iter().map(|(_, target)| *target).max();
    let above = highest.unwrap_or(2) + 1;
    // SAFETY: the closure only calls async-signal-safe functions and does
    // not allocate.
    unsafe {
      command.pre_exec(move || {
        // Move every source out of the way first so no dup2 below clobbers
        // a source that is still needed.
        for (source, _) in extra.iter_mut() {
          let moved = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, above);
          if moved < 0 {
            return Err(io::Error::last_os_error());
          }
          *source = moved;
        }
        for (source, target) in extra.iter() {
          if libc::dup2(*source, *target) < 0 {
            return Err(io::Error::last_os_error());
          }
        }
        Ok(())
      });
    }
  }
  Ok(wiring)
}

#[cfg(not(unix))]
fn wire_stdio(command: &mut Command, spec: &SpawnSpec) -> io::Result<Wiring> {
  let mut wiring = Wiring::default();
  if spec.stdio.len() > 3 {
    return Err(io::Error::from(io::ErrorKind::Unsupported));
  }
  for index in 0..3 {
    let stdio = match spec.stdio.get(index).copied() {
      None | Some(StdioTarget::Ignore) => Stdio::null(),
      Some(StdioTarget::Inherit) => Stdio::inherit(),
      Some(_) => return Err(io::Error::from(io::ErrorKind::Unsupported)),
    };
    set_stdio(command, index, stdio);
    wiring.pipes.push(None);
  }
  Ok(wiring)
}

fn set_stdio(command: &mut Command, index: usize, stdio: Stdio) {
  match index {
    0 => command.stdin(stdio),
    1 => command.stdout(stdio),
    _ => command.stderr(stdio),
  };
}

fn build_command(spec: &SpawnSpec) -> io::Result<(Command, Wiring)> {
  let mut command = Command::new(&spec.file);
  #[cfg(unix)]
  {
    use std::os::unix::process::CommandExt;
    if let Some(arg0) = spec.argv.first() {
      command.arg0(arg0);
    }
    if let Some(uid) = spec.uid {
      command.uid(uid);
    }
    if let Some(gid) = spec.gid {
      command.gid(gid);
    }
    if spec.detached {
      command.process_group(0);
    }
  }
  command.args(spec.argv.iter().skip(1));
  if let Some(env) = &spec.env {
    command.env_clear();
    command.envs(env.iter().map(|(k, v)| (k, v)));
  }
  if let Some(cwd) = &spec.cwd {
    command.current_dir(cwd);
  }
  let wiring = wire_stdio(&mut command, spec)?;
  Ok((command, wiring))
}

#[cfg(unix)]
fn term_signal(status: &ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn term_signal(_status: &ExitStatus) -> i32 {
  0
}

/// Sends `signum` to an arbitrary process.
#[cfg(unix)]
pub(crate) fn kill_pid(pid: i32, signum: i32) -> i32 {
  // SAFETY: kill has no memory safety preconditions.
  if unsafe { libc::kill(pid, signum) } == 0 {
    0
  } else {
    status_from_io(&io::Error::last_os_error())
  }
}

#[cfg(not(unix))]
pub(crate) fn kill_pid(_pid: i32, _signum: i32) -> i32 {
  crate::error::UV_ENOSYS
}

/// Wakes the loop when a child exits. Without it exits are only noticed by
/// polling.
#[derive(Default)]
pub(crate) struct ExitWatch {
  #[cfg(unix)]
  signal: Option<tokio::signal::unix::Signal>,
}

impl ExitWatch {
  /// Subscribes to `SIGCHLD`. Must run inside the loop's runtime context.
  #[cfg(unix)]
  fn arm(&mut self) {
    use tokio::signal::unix::SignalKind;
    if self.signal.is_some() {
      return;
    }
    match tokio::signal::unix::signal(SignalKind::child()) {
      Ok(signal) => self.signal = Some(signal),
      Err(err) => log::debug!("falling back to polling for exits: {err}"),
    }
  }

  #[cfg(not(unix))]
  fn arm(&mut self) {}

  pub(crate) fn is_armed(&self) -> bool {
    #[cfg(unix)]
    {
      self.signal.is_some()
    }
    #[cfg(not(unix))]
    {
      false
    }
  }

  /// Consumes pending notifications and registers `cx` for the next one.
  fn drain(&mut self, cx: &mut Context) {
    #[cfg(unix)]
    if let Some(signal) = self.signal.as_mut() {
      while let std::task::Poll::Ready(Some(())) = signal.poll_recv(cx) {}
    }
    #[cfg(not(unix))]
    let _ = cx;
  }
}

impl NativeLoop {
  fn process_mut(&mut self, id: NativeId) -> Option<&mut ProcessState> {
    match self.object_mut(id)? {
      NativeObject::Process(process) => Some(process),
      _ => None,
    }
  }

  /// Initializes the reserved slot by spawning the child described by
  /// `spec`. Must run inside the loop's runtime context.
  pub(crate) fn process_spawn(
    &mut self,
    id: NativeId,
    spec: &SpawnSpec,
  ) -> i32 {
    let status = self.init_object(
      id,
      HandleKind::Process,
      NativeObject::Process(ProcessState::default()),
    );
    if status < 0 {
      return status;
    }
    self.exit_watch.arm();
    let spawned = build_command(spec).and_then(|(mut command, wiring)| {
      let child = command.spawn()?;
      Ok((child, wiring.pipes))
    });
    let Some(process) = self.process_mut(id) else {
      return UV_EINVAL;
    };
    match spawned {
      Ok((child, pipes)) => {
        process.pid = child.id();
        process.pipes = pipes;
        process.child = Some(child);
        self.waker.wake_by_ref();
        0
      }
      Err(err) => status_from_io(&err),
    }
  }

  pub(crate) fn process_pid(&self, id: NativeId) -> Option<u32> {
    match self.slots.get(&id).map(|slot| &slot.object) {
      Some(NativeObject::Process(process)) if process.child.is_some() => {
        Some(process.pid)
      }
      _ => None,
    }
  }

  pub(crate) fn process_kill(&mut self, id: NativeId, signum: i32) -> i32 {
    let Some(process) = self.process_mut(id) else {
      return UV_EINVAL;
    };
    if !process.is_running() {
      return UV_ESRCH;
    }
    kill_pid(process.pid as i32, signum)
  }

  pub(crate) fn process_take_pipe(
    &mut self,
    id: NativeId,
    index: usize,
  ) -> Option<ChildPipe> {
    self.process_mut(id)?.pipes.get_mut(index)?.take()
  }

  pub(crate) fn has_running_processes(&self) -> bool {
    self.slots.values().any(|slot| match &slot.object {
      NativeObject::Process(process) => !slot.closing && process.is_running(),
      _ => false,
    })
  }

  /// Collects children that have exited since the last call.
  pub(crate) fn poll_exits(&mut self, cx: &mut Context) -> Vec<ProcessExit> {
    self.exit_watch.drain(cx);
    let mut exits = Vec::new();
    for (id, slot) in self.slots.iter_mut() {
      if slot.closing {
        continue;
      }
      let NativeObject::Process(process) = &mut slot.object else {
        continue;
      };
      if process.exited {
        continue;
      }
      let Some(child) = process.child.as_mut() else {
        continue;
      };
      match child.try_wait() {
        Ok(Some(status)) => {
          process.exited = true;
          exits.push(ProcessExit {
            id: *id,
            exit_status: status.code().map(i64::from).unwrap_or(0),
            term_signal: term_signal(&status),
          });
        }
        Ok(None) => {}
        Err(err) => {
          log::debug!("waiting on pid {} failed: {err}", process.pid);
        }
      }
    }
    self
      .orphans
      .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
    exits
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::io::Read;
  use std::io::Write;

  #[test]
  fn test_pipe_direction() {
    let (ChildPipe::Writer(mut parent), mut child) =
      child_pipe(true, false).unwrap()
    else {
      panic!("expected a writer");
    };
    parent.write_all(b"in").unwrap();
    let mut buf = [0u8; 2];
    child.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"in");
    assert!(child.write_all(b"x").is_err());

    let (ChildPipe::Reader(mut parent), mut child) =
      child_pipe(false, true).unwrap()
    else {
      panic!("expected a reader");
    };
    child.write_all(b"out").unwrap();
    drop(child);
    let mut out = String::new();
    parent.read_to_string(&mut out).unwrap();
    assert_eq!(out, "out");
    assert!(parent.write_all(b"x").is_err());

    assert!(matches!(
      child_pipe(true, true).unwrap().0,
      ChildPipe::Duplex(_)
    ));
  }
}
