// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! monomux is a session persistence tool that works similarly to
//! tmux, but aims to provide a much smaller surface area: one daemon,
//! one client, one kind of session.

use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

use monomux_core::consts::{DEFAULT_SOCKET_NAME, RUNTIME_DIR_NAME};
use monomux_core::{client::Client, server::Server};
use monomux_protocol::{DetachMode, MakeSessionRequest, SpawnOptions};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line arguments monomux expects.
#[derive(Parser, Debug)]
#[clap(author, about, version = VERSION)]
struct Args {
    #[clap(short, long, action, help = "The file to write logs to")]
    log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The path for the unix socket to listen on/connect to

Defaults to $XDG_RUNTIME_DIR/mnmx/mnmx.sock, or ~/.mnmx/mnmx.sock if
XDG_RUNTIME_DIR is unset."
    )]
    socket: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    config_file: Option<String>,

    #[clap(long, action, help = "Run as the daemon holding the pool of sessions")]
    server: bool,

    #[clap(long, action, help = "List running sessions, one per line")]
    list: bool,

    #[clap(long, action, help = "Detach the most recently active client of a session")]
    detach: bool,

    #[clap(long, action, help = "Detach every client attached to a session")]
    detach_all: bool,

    #[clap(short, long, action, help = "The name of the session to create or attach to")]
    name: Option<String>,

    #[clap(long, action, help = "Fail instead of spawning a daemon if none is reachable")]
    no_daemon: bool,

    #[clap(long, action, help = "Keep the daemon alive even after this was its last session")]
    keepalive: bool,

    #[clap(
        last = true,
        help = "Program and arguments to run for a newly created session (after --)"
    )]
    command: Vec<String>,
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    let code = match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{:?}", err);
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(args: &Args) {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let builder = tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
    if let Some(log_file) = &args.log_file {
        if let Ok(file) = std::fs::File::create(log_file) {
            builder.with_writer(Mutex::new(file)).init();
            return;
        }
    }
    if args.server {
        builder.with_writer(io::stderr).init();
    }
}

fn run(args: Args) -> Result<i32> {
    let socket = resolve_socket_path(&args.socket)?;

    if args.server {
        let config = monomux_core::config::read_config(&args.config_file)?;
        let mut server = Server::bind(&socket)?;
        server.exit_on_last_session_terminate = config.exit_on_last_session_terminate;
        server.unset_env = config.unset_env;
        server.run()?;
        return Ok(0);
    }

    if args.list {
        let mut client = connect(&socket, args.no_daemon)?;
        for session in client.request_session_list()? {
            println!("{}", session.name);
        }
        return Ok(0);
    }

    let Some(name) = args.name.clone() else {
        eprintln!("--name is required unless --server or --list is given");
        return Ok(2);
    };

    if args.detach || args.detach_all {
        let mut client = connect(&socket, args.no_daemon)?;
        let mode = if args.detach_all { DetachMode::All } else { DetachMode::Latest };
        client.request_detach(mode, Some(name))?;
        return Ok(0);
    }

    attach_or_create(&socket, &name, &args)
}

fn attach_or_create(socket: &std::path::Path, name: &str, args: &Args) -> Result<i32> {
    let mut client = connect(socket, args.no_daemon)?;

    let attached = client.request_attach(name)?;
    if !attached.success {
        let config = monomux_core::config::read_config(&args.config_file)?;
        let spawn = SpawnOptions {
            program: default_program(&args.command, &config.default_shell),
            args: extra_args(&args.command),
            env_set: Vec::new(),
            env_unset: Vec::new(),
        };
        let made = client.request_make_session(MakeSessionRequest { name: name.to_string(), spawn })?;
        if !made.success {
            eprintln!("could not create session {name:?}");
            return Ok(1);
        }
        let attached = client.request_attach(name)?;
        if !attached.success {
            eprintln!("created session {name:?} but failed to attach to it");
            return Ok(1);
        }
    }

    if let Ok((rows, cols)) = terminal_size() {
        client.notify_window_size(rows, cols)?;
    }

    client.main_loop()
}

fn default_program(command: &[String], default_shell: &Option<String>) -> String {
    command.first().cloned().unwrap_or_else(|| {
        default_shell.clone().unwrap_or_else(|| {
            env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        })
    })
}

fn extra_args(command: &[String]) -> Vec<String> {
    command.iter().skip(1).cloned().collect()
}

fn connect(socket: &std::path::Path, no_daemon: bool) -> Result<Client> {
    match Client::connect(socket) {
        Ok(client) => Ok(client),
        Err(e) if no_daemon => Err(e).context("no daemon reachable and --no-daemon was given"),
        Err(_) => {
            spawn_daemon(socket)?;
            Client::connect(socket).context("connecting after spawning daemon")
        }
    }
}

fn spawn_daemon(socket: &std::path::Path) -> Result<()> {
    let exe = env::current_exe().context("finding our own executable to re-exec as daemon")?;
    std::process::Command::new(exe)
        .arg("--server")
        .arg("--socket")
        .arg(socket)
        .spawn()
        .context("spawning daemon")?;
    // Give the freshly spawned daemon a moment to bind its socket
    // before the caller's first connection attempt.
    std::thread::sleep(std::time::Duration::from_millis(100));
    Ok(())
}

fn resolve_socket_path(explicit: &Option<String>) -> Result<PathBuf> {
    if let Some(s) = explicit {
        return Ok(PathBuf::from(s));
    }
    let runtime_dir = match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => PathBuf::from(env::var("HOME").context("no XDG_RUNTIME_DIR or HOME")?).join(format!(".{RUNTIME_DIR_NAME}")),
    };
    Ok(runtime_dir.join(RUNTIME_DIR_NAME).join(DEFAULT_SOCKET_NAME))
}

fn terminal_size() -> Result<(u16, u16)> {
    let mut size = nix::pty::Winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };
    unsafe {
        if libc::ioctl(monomux_core::consts::STDOUT_FD, libc::TIOCGWINSZ, &mut size as *mut _) != 0 {
            return Err(std::io::Error::last_os_error()).context("TIOCGWINSZ");
        }
    }
    Ok((size.ws_row, size.ws_col))
}
