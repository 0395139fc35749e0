use std::{
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::monomux_bin;

/// Proc is a helper handle for a `monomux --server` subprocess. It kills
/// the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    subproc_counter: usize,
    local_tmp_dir: Option<TempDir>,
    pub tmp_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl Proc {
    pub fn new(config_file: Option<&str>) -> anyhow::Result<Proc> {
        let local_tmp_dir = tempfile::Builder::new()
            .prefix("monomux-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let tmp_dir = local_tmp_dir.path().to_path_buf();

        let socket_path = tmp_dir.join("mnmx.sock");
        let log_file = tmp_dir.join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let mut cmd = Command::new(monomux_bin()?);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&socket_path)
            .arg("--server");
        if let Some(config_file) = config_file {
            cmd.arg("--config-file").arg(config_file);
        }
        let proc = cmd.spawn().context("spawning daemon process")?;

        // spin until we can dial the socket successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Ok(Proc { proc, local_tmp_dir: Some(local_tmp_dir), tmp_dir, subproc_counter: 0, socket_path })
    }

    /// Spawns a client that attaches to (creating if necessary) the
    /// named session and runs `program` in it.
    pub fn attach(&mut self, name: &str, program: &str) -> anyhow::Result<process::Child> {
        let log_file = self.tmp_dir.join(format!("attach_{}_{}.log", name, self.subproc_counter));
        eprintln!("spawning attach proc with log {:?}", &log_file);
        self.subproc_counter += 1;

        Command::new(monomux_bin()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::piped())
            .arg("-v")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&self.socket_path)
            .arg("--no-daemon")
            .arg("--name")
            .arg(name)
            .arg("--")
            .arg(program)
            .spawn()
            .context(format!("spawning attach proc for {name}"))
    }

    pub fn detach(&mut self, name: &str, all: bool) -> anyhow::Result<process::Output> {
        let log_file = self.tmp_dir.join(format!("detach_{}.log", self.subproc_counter));
        eprintln!("spawning detach proc with log {:?}", &log_file);
        self.subproc_counter += 1;

        let mut cmd = Command::new(monomux_bin()?);
        cmd.arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&self.socket_path)
            .arg("--no-daemon")
            .arg("--name")
            .arg(name);
        if all {
            cmd.arg("--detach-all");
        } else {
            cmd.arg("--detach");
        }

        cmd.output().context("spawning detach proc")
    }

    /// list launches a `monomux --list` process, collects the output
    /// and returns it.
    pub fn list(&mut self) -> anyhow::Result<process::Output> {
        let log_file = self.tmp_dir.join(format!("list_{}.log", self.subproc_counter));
        eprintln!("spawning list proc with log {:?}", &log_file);
        self.subproc_counter += 1;

        Command::new(monomux_bin()?)
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&self.socket_path)
            .arg("--no-daemon")
            .arg("--list")
            .output()
            .context("spawning list proc")
    }
}

impl std::ops::Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing daemon proc: {:?}", e);
        }
        if std::env::var("MONOMUX_LEAVE_TEST_LOGS").unwrap_or(String::from("")) == "true" {
            self.local_tmp_dir.take().map(|d| d.into_path());
        }
    }
}
