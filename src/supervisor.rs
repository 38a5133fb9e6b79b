//! Built-in supervisor that restarts the engine on crash.
//!
//! `gse-tunnel supervise` spawns `gse-tunnel run` and monitors it. On abnormal
//! exit the engine is restarted with exponential backoff. A clean exit (code 0)
//! stops the supervisor, and so does SIGINT/SIGTERM, which is forwarded to the
//! child first.

use std::io;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use gse_tunnel::config::SupervisorConfig;

/// Delay before the next restart. A child that stayed up past the stable
/// threshold resets the backoff.
fn next_backoff(current: u64, uptime: Duration, config: &SupervisorConfig) -> u64 {
    if uptime >= Duration::from_secs(config.stable_threshold) {
        1
    } else {
        current.saturating_mul(2).min(config.max_backoff.max(1))
    }
}

fn forward(child: &Child, signal: libc::c_int, name: &str) {
    info!("Supervisor: forwarding {name} to child");
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = pid as libc::pid_t;
        // SAFETY: kill(2) on a child we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

/// Run the supervisor loop until the child exits cleanly or a signal arrives.
pub async fn run_supervisor(
    config_path: Option<&str>,
    config: &SupervisorConfig,
) -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut backoff = 1u64;

    loop {
        let started = Instant::now();

        let mut cmd = Command::new(&exe);
        cmd.arg("run");
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }
        let mut child = cmd.spawn()?;
        info!("Supervisor: started engine (pid {:?})", child.id());

        let mut stopping = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = sigint.recv(), if !stopping => {
                    forward(&child, libc::SIGINT, "SIGINT");
                    stopping = true;
                }
                _ = sigterm.recv(), if !stopping => {
                    forward(&child, libc::SIGTERM, "SIGTERM");
                    stopping = true;
                }
            }
        };
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Engine exited cleanly, supervisor stopping");
                return Ok(());
            }
            Ok(s) if stopping => {
                info!("Engine stopped after signal ({s}), supervisor stopping");
                return Ok(());
            }
            Ok(s) => warn!(
                "Engine exited: {s} (uptime {:.1}s), restarting in {backoff}s",
                uptime.as_secs_f64()
            ),
            Err(e) => error!(
                "Engine wait error: {e} (uptime {:.1}s), restarting in {backoff}s",
                uptime.as_secs_f64()
            ),
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = next_backoff(backoff, uptime, config);
    }
}
