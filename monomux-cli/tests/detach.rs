use std::process::Command;

use anyhow::Context;
use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn single_running() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon_proc = support::daemon::Proc::new(None).context("starting daemon proc")?;
        let mut attach_proc = daemon_proc.attach("sh1", "cat").context("starting attach proc")?;

        support::wait_until(|| {
            let out = daemon_proc.list()?;
            let stdout = String::from_utf8_lossy(&out.stdout[..]);
            Ok(stdout.contains("sh1"))
        })?;

        let out = daemon_proc.detach("sh1", false)?;
        assert!(out.status.success(), "not successful");

        let stderr = String::from_utf8_lossy(&out.stderr[..]);
        assert_eq!(stderr.len(), 0, "expected no stderr");

        let exit_status = attach_proc.wait()?;
        assert!(exit_status.success());

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn not_attached_is_a_noop() -> anyhow::Result<()> {
    // Detaching a session nobody is attached to is acknowledged, not an
    // error: the protocol has no notion of "nothing to detach" failure,
    // only a bare ack.
    support::dump_err(|| {
        let mut daemon_proc = support::daemon::Proc::new(None).context("starting daemon proc")?;

        let out = daemon_proc.detach("sh1", false)?;
        assert!(out.status.success(), "expected a no-op detach to still succeed");

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn no_daemon() -> anyhow::Result<()> {
    support::dump_err(|| {
        let out = Command::new(support::monomux_bin()?)
            .arg("--socket")
            .arg("/fake/does/not/exist/mnmx.sock")
            .arg("--no-daemon")
            .arg("--name")
            .arg("sh1")
            .arg("--detach")
            .output()
            .context("spawning detach proc")?;

        assert!(!out.status.success(), "detach proc exited successfully");

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn detach_all() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon_proc = support::daemon::Proc::new(None).context("starting daemon proc")?;
        let mut attach1 = daemon_proc.attach("sh1", "cat").context("starting first attach proc")?;
        let mut attach2 = daemon_proc.attach("sh1", "cat").context("starting second attach proc")?;

        support::wait_until(|| {
            let out = daemon_proc.list()?;
            let stdout = String::from_utf8_lossy(&out.stdout[..]);
            Ok(stdout.contains("sh1"))
        })?;

        let out = daemon_proc.detach("sh1", true)?;
        assert!(out.status.success(), "not successful");

        let status1 = attach1.wait()?;
        let status2 = attach2.wait()?;
        assert!(status1.success());
        assert!(status2.success());

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn double_tap() -> anyhow::Result<()> {
    // A second detach of an already-detached session is just another
    // no-op ack, for the same reason as `not_attached_is_a_noop`.
    support::dump_err(|| {
        let mut daemon_proc = support::daemon::Proc::new(None).context("starting daemon proc")?;
        let mut attach_proc = daemon_proc.attach("sh1", "cat").context("starting attach proc")?;

        support::wait_until(|| {
            let out = daemon_proc.list()?;
            let stdout = String::from_utf8_lossy(&out.stdout[..]);
            Ok(stdout.contains("sh1"))
        })?;

        let out1 = daemon_proc.detach("sh1", false)?;
        assert!(out1.status.success(), "not successful");
        attach_proc.wait()?;

        let out2 = daemon_proc.detach("sh1", false)?;
        assert!(out2.status.success(), "expected a no-op detach to still succeed");

        Ok(())
    })
}
