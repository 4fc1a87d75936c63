// Copyright 2018-2025 the Deno authors. MIT license.

use anyhow::Context;
use anyhow::Error;
use anyhow::bail;
use bytes::Bytes;
use clap::ArgMatches;
use clap::builder::Arg;
use clap::builder::ArgAction;
use clap::builder::Command;
use std::cell::Cell;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use uvbridge::CallbackError;
use uvbridge::FsEvent;
use uvbridge::Loop;
use uvbridge::LoopOptions;
use uvbridge::Process;
use uvbridge::ProcessOptions;
use uvbridge::RunMode;
use uvbridge::StdioBinding;
use uvbridge::Tcp;
use uvbridge::Timer;
use uvbridge::UV_FS_EVENT_RECURSIVE;
use uvbridge::UV_RENAME;
use uvbridge::Value;
use uvbridge::callback;

fn main() -> Result<(), Error> {
  eprintln!("🛑 uvcat is meant for development and testing purposes.");

  let matches = build_cli().get_matches();
  let event_loop = Loop::new(LoopOptions::default())?;
  match matches.subcommand() {
    Some(("spawn", matches)) => spawn(&event_loop, matches),
    Some(("connect", matches)) => connect(&event_loop, matches),
    Some(("watch", matches)) => watch(&event_loop, matches),
    Some(("tick", matches)) => tick(&event_loop, matches),
    _ => unreachable!("clap requires a subcommand"),
  }
}

fn build_cli() -> Command {
  Command::new("uvcat")
    .subcommand_required(true)
    .subcommand(
      Command::new("spawn")
        .about("Run a child process and report how it exited")
        .arg(
          Arg::new("options")
            .long("options")
            .value_name("JSON")
            .help("Spawn options as JSON; a bare string is the file to run")
            .conflicts_with("file"),
        )
        .arg(
          Arg::new("file")
            .help("The program to run")
            .value_hint(clap::ValueHint::CommandName)
            .required_unless_present("options"),
        )
        .arg(
          Arg::new("args")
            .help("Arguments passed to the program")
            .num_args(0..)
            .trailing_var_arg(true)
            .allow_hyphen_values(true),
        ),
    )
    .subcommand(
      Command::new("connect")
        .about("Send stdin to host:port and copy the reply to stdout")
        .arg(Arg::new("host").required(true))
        .arg(
          Arg::new("port")
            .required(true)
            .value_parser(clap::value_parser!(u16)),
        ),
    )
    .subcommand(
      Command::new("watch")
        .about("Print filesystem events for a path")
        .arg(
          Arg::new("path")
            .required(true)
            .value_hint(clap::ValueHint::AnyPath)
            .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
          Arg::new("recursive")
            .long("recursive")
            .short('r')
            .action(ArgAction::SetTrue),
        )
        .arg(
          Arg::new("count")
            .long("count")
            .help("Stop after this many events")
            .value_parser(clap::value_parser!(u64)),
        ),
    )
    .subcommand(
      Command::new("tick")
        .about("Fire a repeating timer and print the loop time")
        .arg(
          Arg::new("interval")
            .long("interval")
            .default_value("100")
            .value_parser(clap::value_parser!(u64)),
        )
        .arg(
          Arg::new("count")
            .long("count")
            .default_value("5")
            .value_parser(clap::value_parser!(u64)),
        ),
    )
}

fn spawn(event_loop: &Loop, matches: &ArgMatches) -> Result<(), Error> {
  let mut options = match matches.get_one::<String>("options") {
    Some(json) => {
      let value = serde_json::from_str(json).context("Invalid --options")?;
      ProcessOptions::from_value(value)?
    }
    None => {
      let file = matches
        .get_one::<String>("file")
        .context("Missing program")?;
      ProcessOptions {
        args: matches
          .get_many::<String>("args")
          .map(|args| args.cloned().collect())
          .unwrap_or_default(),
        ..ProcessOptions::from(file.as_str())
      }
    }
  };
  if options.stdio.is_empty() {
    options.stdio = (0..3).map(StdioBinding::InheritFd).collect();
  }

  let exit_code = Rc::new(Cell::new(None));
  let exit_code_ = exit_code.clone();
  let on_exit = callback(move |args: &[Value]| {
    let status = args[1].as_integer().unwrap_or_default();
    let signal = args[2].as_integer().unwrap_or_default();
    eprintln!("exited with status {status}, signal {signal}");
    exit_code_.set(Some(status));
    Ok(())
  });
  let (process, pid) = Process::spawn(event_loop, &options, Some(on_exit))?;
  eprintln!("spawned {} as pid {pid}", options.file);
  event_loop.run(RunMode::Default)?;
  process.close()?;
  event_loop.run(RunMode::Default)?;
  match exit_code.get() {
    Some(0) => Ok(()),
    Some(code) => {
      let code = i32::try_from(code)
        .with_context(|| format!("exit status {code} out of range"))?;
      std::process::exit(code)
    }
    None => bail!("child did not report an exit status"),
  }
}

fn connect(event_loop: &Loop, matches: &ArgMatches) -> Result<(), Error> {
  let host = matches.get_one::<String>("host").context("Missing host")?;
  let port = *matches.get_one::<u16>("port").context("Missing port")?;
  let mut input = Vec::new();
  std::io::stdin()
    .read_to_end(&mut input)
    .context("Unable to read stdin")?;
  let input = Bytes::from(input);

  let tcp = Tcp::new(event_loop)?;
  tcp.connect(host, port, move |args| {
    if let Some(err) = args[1].as_error() {
      return Err(err.clone().into());
    }
    let tcp = Tcp::try_from(args[0].as_handle().cloned().ok_or_else(
      || CallbackError::thrown("connect callback without its handle"),
    )?)?;
    let peer = tcp.peername()?;
    eprintln!("connected to {}:{}", peer.host, peer.port);
    tcp.write(input.clone(), |_| Ok(()))?;
    tcp.shutdown(|_| Ok(()))?;
    tcp.read_start(|args| {
      if let Some(err) = args[1].as_error() {
        if err.is_eof() {
          if let Some(handle) = args[0].as_handle() {
            handle.close()?;
          }
          return Ok(());
        }
        return Err(err.clone().into());
      }
      if let Some(data) = args.get(2).and_then(Value::as_bytes) {
        let mut stdout = std::io::stdout().lock();
        stdout
          .write_all(data)
          .and_then(|_| stdout.flush())
          .map_err(|err| CallbackError::thrown(err.to_string()))?;
      }
      Ok(())
    })?;
    Ok(())
  })?;
  event_loop.run(RunMode::Default)?;
  Ok(())
}

fn watch(event_loop: &Loop, matches: &ArgMatches) -> Result<(), Error> {
  let path = matches.get_one::<PathBuf>("path").context("Missing path")?;
  let flags = if matches.get_flag("recursive") {
    UV_FS_EVENT_RECURSIVE
  } else {
    0
  };
  let limit = matches.get_one::<u64>("count").copied();
  let seen = Rc::new(Cell::new(0u64));

  let watcher = FsEvent::new(event_loop)?;
  watcher.start(path, flags, move |args| {
    if let Some(err) = args[1].as_error() {
      return Err(err.clone().into());
    }
    let filename = args[2].as_str().unwrap_or("<unknown>");
    let events = args[3].as_integer().unwrap_or_default();
    let kind = if events & i64::from(UV_RENAME) != 0 {
      "rename"
    } else {
      "change"
    };
    println!("{kind} {filename}");
    seen.set(seen.get() + 1);
    if limit.is_some_and(|limit| seen.get() >= limit)
      && let Some(handle) = args[0].as_handle()
    {
      handle.close()?;
    }
    Ok(())
  })?;
  eprintln!("watching {}", watcher.path()?.display());
  event_loop.run(RunMode::Default)?;
  Ok(())
}

fn tick(event_loop: &Loop, matches: &ArgMatches) -> Result<(), Error> {
  let interval = *matches.get_one::<u64>("interval").context("interval")?;
  let count = *matches.get_one::<u64>("count").context("count")?;
  let fired = Rc::new(Cell::new(0u64));
  let fired_ = fired.clone();

  let timer = Timer::new(event_loop)?;
  let started = event_loop.now();
  timer.start(interval, interval, move |args| {
    fired_.set(fired_.get() + 1);
    let Some(handle) = args[0].as_handle() else {
      return Ok(());
    };
    println!(
      "tick {} at +{}ms",
      fired_.get(),
      handle.event_loop().now() - started
    );
    if fired_.get() >= count {
      Timer::try_from(handle.clone())?.stop()?;
    }
    Ok(())
  })?;
  event_loop.run(RunMode::Default)?;
  timer.close()?;
  event_loop.run(RunMode::Default)?;
  event_loop.close()?;
  eprintln!("{} ticks", fired.get());
  Ok(())
}
