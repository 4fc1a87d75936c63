// Copyright 2018-2025 the Deno authors. MIT license.

//! Options accepted by [`crate::Process::spawn`].

use crate::error::UvError;
use crate::handle::Handle;
use crate::handle::HandleKind;
use serde::Deserialize;
use std::path::PathBuf;

/// Spawn flags. `setuid`/`setgid` are also implied by setting `uid`/`gid`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct ProcessFlags {
  pub setuid: bool,
  pub setgid: bool,
  /// Windows only.
  pub verbatim: bool,
  /// The child is put in its own process group and its handle is not closed
  /// when the wrapper is dropped.
  pub detached: bool,
  /// Windows only.
  pub hide: bool,
}

impl TryFrom<Vec<String>> for ProcessFlags {
  type Error = String;

  fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
    let mut flags = ProcessFlags::default();
    for name in names {
      match name.as_str() {
        "setuid" => flags.setuid = true,
        "setgid" => flags.setgid = true,
        "verbatim" => flags.verbatim = true,
        "detached" => flags.detached = true,
        "hide" => flags.hide = true,
        other => return Err(format!("unknown process flag: {other}")),
      }
    }
    Ok(flags)
  }
}

/// How one of the child's standard streams is wired.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStdio")]
pub enum StdioBinding {
  Ignore,
  /// The child gets a duplicate of this descriptor.
  InheritFd(i32),
  /// The child gets a duplicate of this TCP handle's socket.
  InheritStream(Handle),
  /// A new pipe; the parent end is available through
  /// [`crate::Process::take_pipe`].
  CreatePipe { readable: bool, writable: bool },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStdio {
  Fd(i32),
  Name(String),
  Entry {
    #[serde(default)]
    fd: Option<i32>,
    #[serde(default)]
    flags: Vec<String>,
  },
}

impl TryFrom<RawStdio> for StdioBinding {
  type Error = String;

  fn try_from(raw: RawStdio) -> Result<Self, Self::Error> {
    match raw {
      RawStdio::Fd(fd) => Ok(StdioBinding::InheritFd(fd)),
      RawStdio::Name(name) => stdio_from_flags(None, &[name]),
      RawStdio::Entry { fd, flags } => stdio_from_flags(fd, &flags),
    }
  }
}

fn stdio_from_flags(
  fd: Option<i32>,
  flags: &[String],
) -> Result<StdioBinding, String> {
  let mut ignore = false;
  let mut pipe = false;
  let mut readable = false;
  let mut writable = false;
  let mut inherit_fd = false;
  for flag in flags {
    match flag.as_str() {
      "ignore" => ignore = true,
      "create_pipe" => pipe = true,
      "readable_pipe" => readable = true,
      "writable_pipe" => writable = true,
      "inherit_fd" => inherit_fd = true,
      "inherit_stream" => {
        return Err("inherit_stream requires a stream handle".to_string());
      }
      other => return Err(format!("unknown stdio flag: {other}")),
    }
  }
  if pipe || readable || writable {
    return Ok(StdioBinding::CreatePipe { readable, writable });
  }
  if inherit_fd || (fd.is_some() && !ignore) {
    let fd = fd.ok_or_else(|| "stdio.fd option must be a number".to_string())?;
    return Ok(StdioBinding::InheritFd(fd));
  }
  Ok(StdioBinding::Ignore)
}

/// Everything needed to start a child process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProcessOptions {
  pub file: String,
  /// Arguments after argv[0]. argv[0] is always `file`.
  #[serde(default)]
  pub args: Vec<String>,
  /// `KEY=VALUE` entries. When set, replaces the parent environment.
  #[serde(default)]
  pub env: Option<Vec<String>>,
  #[serde(default)]
  pub cwd: Option<PathBuf>,
  #[serde(default)]
  pub uid: Option<u32>,
  #[serde(default)]
  pub gid: Option<u32>,
  #[serde(default)]
  pub flags: ProcessFlags,
  #[serde(default)]
  pub stdio: Vec<StdioBinding>,
}

impl From<&str> for ProcessOptions {
  fn from(file: &str) -> Self {
    ProcessOptions {
      file: file.to_string(),
      ..Default::default()
    }
  }
}

impl ProcessOptions {
  /// Accepts either a bare string (the file to run) or an options object.
  pub fn from_value(value: serde_json::Value) -> Result<Self, UvError> {
    match value {
      serde_json::Value::String(file) => Ok(ProcessOptions::from(&*file)),
      value @ serde_json::Value::Object(_) => serde_json::from_value(value)
        .map_err(|err| UvError::argument(err.to_string())),
      _ => Err(UvError::argument("options must be an object or a string")),
    }
  }

  /// Checks everything that can be checked without touching the OS.
  pub fn validate(&self) -> Result<(), UvError> {
    if self.file.is_empty() {
      return Err(UvError::argument(
        "file option required and must be a string",
      ));
    }
    if let Some(env) = &self.env
      && env.iter().any(|entry| !entry.contains('='))
    {
      return Err(UvError::argument(
        "env option must be an array of KEY=VALUE strings",
      ));
    }
    for binding in &self.stdio {
      if let StdioBinding::InheritStream(handle) = binding {
        if handle.kind() != HandleKind::Tcp {
          return Err(UvError::argument("stdio stream must be a tcp handle"));
        }
        handle.check_open()?;
      }
    }
    Ok(())
  }

  pub fn argv(&self) -> Vec<String> {
    std::iter::once(self.file.clone())
      .chain(self.args.iter().cloned())
      .collect()
  }

  /// The environment as key/value pairs, if one was given.
  pub fn env_pairs(&self) -> Option<Vec<(String, String)>> {
    self.env.as_ref().map(|env| {
      env
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    })
  }

  /// Flags with `setuid`/`setgid` implied by `uid`/`gid`.
  pub fn effective_flags(&self) -> ProcessFlags {
    ProcessFlags {
      setuid: self.flags.setuid || self.uid.is_some(),
      setgid: self.flags.setgid || self.gid.is_some(),
      ..self.flags
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  #[test]
  fn test_bare_string_is_file() {
    let options = ProcessOptions::from_value(json!("ls")).unwrap();
    assert_eq!(options.file, "ls");
    assert_eq!(options.argv(), vec!["ls".to_string()]);
  }

  #[test]
  fn test_full_options() {
    let options = ProcessOptions::from_value(json!({
      "file": "sh",
      "args": ["-c", "exit 3"],
      "env": ["A=1", "B=x=y"],
      "cwd": "/tmp",
      "uid": 1000,
      "flags": ["detached"],
      "stdio": [{ "flags": ["create_pipe", "readable_pipe"] }, 1, { "fd": 2 }],
    }))
    .unwrap();
    assert_eq!(options.argv(), vec!["sh", "-c", "exit 3"]);
    assert_eq!(
      options.env_pairs(),
      Some(vec![
        ("A".to_string(), "1".to_string()),
        ("B".to_string(), "x=y".to_string())
      ])
    );
    assert_eq!(
      options.stdio,
      vec![
        StdioBinding::CreatePipe {
          readable: true,
          writable: false
        },
        StdioBinding::InheritFd(1),
        StdioBinding::InheritFd(2),
      ]
    );
    let flags = options.effective_flags();
    assert!(flags.detached);
    assert!(flags.setuid);
    assert!(!flags.setgid);
    options.validate().unwrap();
  }

  #[test]
  fn test_stdio_entries() {
    let options = ProcessOptions::from_value(json!({
      "file": "cat",
      "stdio": ["ignore", {}, { "fd": 4, "flags": ["ignore"] }],
    }))
    .unwrap();
    assert_eq!(
      options.stdio,
      vec![
        StdioBinding::Ignore,
        StdioBinding::Ignore,
        StdioBinding::Ignore
      ]
    );
  }

  #[test]
  fn test_invalid_options() {
    assert!(ProcessOptions::from_value(json!(42)).is_err());
    assert!(ProcessOptions::from_value(json!({ "args": [] })).is_err());
    assert!(
      ProcessOptions::from_value(json!({ "file": "a", "flags": ["bogus"] }))
        .is_err()
    );
    let err = ProcessOptions::default().validate().unwrap_err();
    assert_eq!(err.to_string(), "file option required and must be a string");
    let options = ProcessOptions {
      env: Some(vec!["NOEQUALS".to_string()]),
      ..ProcessOptions::from("a")
    };
    assert!(options.validate().is_err());
  }
}
