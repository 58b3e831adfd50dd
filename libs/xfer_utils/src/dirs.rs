//! App-data-directory helpers for the per-host files named in §6:
//! the coordinator's Unix socket, Windows named pipe and PID file.
//!
//! The product name (`app_name`) is supplied by the embedder; the core
//! never hardcodes it.

use camino::Utf8PathBuf;
use std::io;

/// `~/.config/<app_name>` (or the platform equivalent via `dirs::config_dir`).
pub fn config_dir(app_name: &str) -> io::Result<Utf8PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no config directory for platform"))?;
    let dir = Utf8PathBuf::from_path_buf(base.join(app_name))
        .map_err(|p| io::Error::new(io::ErrorKind::InvalidInput, format!("{p:?} is not UTF-8")))?;
    Ok(dir)
}

pub fn coordinator_socket_path(app_name: &str) -> io::Result<Utf8PathBuf> {
    Ok(config_dir(app_name)?.join("ratelimit-coordinator.sock"))
}

pub fn coordinator_pid_path(app_name: &str) -> io::Result<Utf8PathBuf> {
    Ok(config_dir(app_name)?.join("ratelimit-coordinator.pid"))
}

/// `\\.\pipe\<app_name>-ratelimit-coordinator` on Windows.
pub fn coordinator_pipe_name(app_name: &str) -> String {
    format!(r"\\.\pipe\{app_name}-ratelimit-coordinator")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_name_is_well_formed() {
        let name = coordinator_pipe_name("acme-client");
        assert!(name.starts_with(r"\\.\pipe\"));
        assert!(name.ends_with("acme-client-ratelimit-coordinator"));
    }
}
