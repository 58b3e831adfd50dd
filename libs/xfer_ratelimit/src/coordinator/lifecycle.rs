//! Discovery and bootstrap for the per-host coordinator daemon (spec §4.2):
//! every process that wants the shared bucket first tries to connect; the
//! one that finds nobody listening spawns a detached copy of itself to
//! become the server, and everyone else just waits for the socket to
//! appear.

use super::transport;
use camino::Utf8Path;
use std::time::{Duration, Instant};
use xfer_utils::{COORDINATOR_CONNECT_TIMEOUT, COORDINATOR_SOCKET_WAIT_TIMEOUT};

/// Set in the environment of a process spawned to become the coordinator
/// server; the host binary's `main` checks this before doing anything
/// else and, if present, calls [`super::server::CoordinatorServer::serve`]
/// instead of its normal startup path.
pub const SERVE_ENV_VAR: &str = "XFER_RATELIMIT_COORDINATOR_SERVE";

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    // Signal 0 performs no delivery, only existence/permission checks.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(unix)]
fn read_pid_file(path: &Utf8Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn write_pid_file(path: &Utf8Path, pid: i32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pid.to_string())
}

/// Connects to the app's coordinator, spawning a detached server process
/// first if nobody answers and no live server's PID file is found.
/// Tolerates the race where two processes both decide to spawn: the loser
/// simply fails to bind and falls back to connecting.
#[cfg(unix)]
pub async fn connect_or_spawn(app_name: &str) -> anyhow::Result<transport::Stream> {
    let socket_path = xfer_utils::coordinator_socket_path(app_name)?;
    let pid_path = xfer_utils::coordinator_pid_path(app_name)?;

    if let Ok(stream) = transport::connect(&socket_path, COORDINATOR_CONNECT_TIMEOUT).await {
        return Ok(stream);
    }

    let server_likely_running = read_pid_file(&pid_path).is_some_and(pid_alive);
    if !server_likely_running {
        spawn_detached_server(app_name, &pid_path)?;
    }

    let deadline = Instant::now() + COORDINATOR_SOCKET_WAIT_TIMEOUT;
    let mut backoff = Duration::from_millis(50);
    loop {
        match transport::connect(&socket_path, COORDINATOR_CONNECT_TIMEOUT).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    anyhow::bail!("coordinator did not become reachable in time: {err}");
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(400));
            }
        }
    }
}

#[cfg(unix)]
fn spawn_detached_server(app_name: &str, pid_path: &Utf8Path) -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .env(SERVE_ENV_VAR, app_name)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // Detach into its own session so it survives the spawning process
    // exiting (e.g. a short-lived CLI invocation).
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    write_pid_file(pid_path, child.id() as i32)?;
    tracing::info!(pid = child.id(), %app_name, "spawned coordinator server");
    Ok(())
}

#[cfg(windows)]
pub async fn connect_or_spawn(app_name: &str) -> anyhow::Result<transport::Stream> {
    let pipe_name = xfer_utils::coordinator_pipe_name(app_name);

    if let Ok(stream) = transport::connect(&pipe_name, COORDINATOR_CONNECT_TIMEOUT).await {
        return Ok(stream);
    }

    spawn_detached_server(app_name)?;

    let deadline = Instant::now() + COORDINATOR_SOCKET_WAIT_TIMEOUT;
    let mut backoff = Duration::from_millis(50);
    loop {
        match transport::connect(&pipe_name, COORDINATOR_CONNECT_TIMEOUT).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    anyhow::bail!("coordinator did not become reachable in time: {err}");
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(400));
            }
        }
    }
}

#[cfg(windows)]
fn spawn_detached_server(app_name: &str) -> anyhow::Result<()> {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x00000008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;

    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .env(SERVE_ENV_VAR, app_name)
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
        .spawn()?;
    tracing::info!(%app_name, "spawned coordinator server");
    Ok(())
}

/// Checked by the host binary's `main` before its normal startup. Returns
/// `Some(app_name)` if this process was spawned to be the coordinator
/// server, in which case the caller should run
/// [`super::server::CoordinatorServer::serve`] and not its usual logic.
pub fn serve_request() -> Option<String> {
    std::env::var(SERVE_ENV_VAR).ok()
}
