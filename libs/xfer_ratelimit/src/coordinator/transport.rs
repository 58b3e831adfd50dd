//! Cross-platform IPC endpoint (spec §4.2, §9: "abstract the endpoint
//! into `Listen()`/`Dial()` with OS-specific implementations"). The wire
//! protocol (newline-delimited JSON) is identical on both platforms; only
//! the transport differs.

use camino::Utf8Path;
use std::io;
use std::time::Duration;

#[cfg(unix)]
pub use unix::{bind, connect, Listener, Stream};
#[cfg(windows)]
pub use windows::{bind, connect, ClientStream as Stream, Listener, ServerStream};

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::{UnixListener, UnixStream};

    pub type Listener = UnixListener;
    pub type Stream = UnixStream;

    /// Binds the coordinator socket, creating the parent directory with
    /// mode 0700 and the socket itself with mode 0600 (spec §6).
    pub fn bind(path: &Utf8Path) -> io::Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
        // A stale socket file from a crashed server must not block bind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        Ok(listener)
    }

    pub async fn connect(path: &Utf8Path, timeout: Duration) -> io::Result<UnixStream> {
        tokio::time::timeout(timeout, UnixStream::connect(path.as_std_path()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, PipeMode, ServerOptions};

    pub struct Listener {
        name: String,
        next: Option<NamedPipeServer>,
    }

    pub type ServerStream = NamedPipeServer;
    pub type ClientStream = tokio::net::windows::named_pipe::NamedPipeClient;

    /// Creates the first pipe instance. The wire protocol is
    /// request-response per connection, so the caller re-creates a new
    /// instance after each client disconnects (see `server::accept_loop`).
    ///
    /// No SDDL is applied here: this uses no security attributes, so the
    /// pipe gets the process default DACL rather than the "authenticated
    /// users only" ACL spec §6 asks for on Windows. The Unix transport
    /// does restrict access (0700/0600 above); the Windows side does not
    /// yet.
    pub fn bind(pipe_name: &str) -> io::Result<Listener> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Byte)
            .create(pipe_name)?;
        Ok(Listener {
            name: pipe_name.to_string(),
            next: Some(server),
        })
    }

    impl Listener {
        pub async fn accept(&mut self) -> io::Result<NamedPipeServer> {
            let server = self
                .next
                .take()
                .expect("accept called twice without re-arming");
            server.connect().await?;
            self.next = Some(ServerOptions::new().create(&self.name)?);
            Ok(server)
        }
    }

    pub async fn connect(pipe_name: &str, timeout: Duration) -> io::Result<ClientStream> {
        tokio::time::timeout(timeout, async {
            loop {
                match ClientOptions::new().open(pipe_name) {
                    Ok(client) => return Ok(client),
                    Err(e) if e.raw_os_error() == Some(231) /* ERROR_PIPE_BUSY */ => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }
}
