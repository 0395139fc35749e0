use std::{io::Read, process::Stdio, time};

use anyhow::{anyhow, Context};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use ntest::timeout;

mod support;

use support::monomux_bin;

#[test]
#[timeout(30000)]
fn start() -> anyhow::Result<()> {
    support::dump_err(|| {
        let tmp_dir = support::tmpdir::Dir::new(std::env::temp_dir())?;

        let mut child = std::process::Command::new(monomux_bin()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("--socket")
            .arg(tmp_dir.path().join("mnmx.sock"))
            .arg("--server")
            .spawn()
            .context("spawning daemon process")?;

        // The server should start up and run without incident for
        // half a second.
        std::thread::sleep(time::Duration::from_millis(500));

        child.kill().context("killing child")?;

        let mut stdout = child.stdout.take().context("missing stdout")?;
        let mut stdout_str = String::new();
        stdout.read_to_string(&mut stdout_str).context("slurping stdout")?;

        if !stdout_str.is_empty() {
            println!("{stdout_str}");
            return Err(anyhow!("unexpected stdout output"));
        }

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn cleanup_socket() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon_proc = support::daemon::Proc::new(None).context("starting daemon proc")?;
        let socket_path = daemon_proc.socket_path.clone();

        signal::kill(Pid::from_raw(daemon_proc.proc.id() as i32), Signal::SIGINT)?;
        daemon_proc.proc.wait()?;

        assert!(!socket_path.exists());
        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn two_clients_share_one_session() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon_proc = support::daemon::Proc::new(None).context("starting daemon proc")?;
        let mut first = daemon_proc.attach("sh1", "cat").context("creating first session")?;

        support::wait_until(|| {
            let out = daemon_proc.list()?;
            let stdout = String::from_utf8_lossy(&out.stdout[..]);
            Ok(stdout.contains("sh1"))
        })?;

        // A second attach to the same name joins the existing session
        // rather than spawning a second process.
        let mut second = daemon_proc.attach("sh1", "cat").context("attaching a second client")?;

        let out = daemon_proc.detach("sh1", true)?;
        assert!(out.status.success());
        first.wait()?;
        second.wait()?;

        Ok(())
    })
}
