//! Userspace mesh connector.
//!
//! Runs a private, userspace-networking mesh daemon per tunnel with its own
//! state directory and control socket, joins the network with the configured
//! auth key, and dials peers through the daemon's loopback SOCKS5 listener.
//! Nothing on the host's own network stack changes.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::ProviderError;

use super::{BoxedStream, Tunnel, TunnelConfig, TunnelConnector};

const SOCKET_NAME: &str = "daemon.sock";
const AUTH_KEY_FILE: &str = "auth.key";

/// Starts a dedicated mesh daemon for every tunnel it connects.
#[derive(Debug, Clone)]
pub struct UserspaceMeshConnector {
    pub daemon_bin: PathBuf,
    pub cli_bin: PathBuf,
    pub startup_timeout: Duration,
}

impl Default for UserspaceMeshConnector {
    fn default() -> Self {
        Self {
            daemon_bin: PathBuf::from("tailscaled"),
            cli_bin: PathBuf::from("tailscale"),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl TunnelConnector for UserspaceMeshConnector {
    async fn connect(&self, config: TunnelConfig) -> Result<Arc<dyn Tunnel>, ProviderError> {
        tokio::fs::create_dir_all(&config.state_dir).await?;

        let socket = config.state_dir.join(SOCKET_NAME);
        let socks_addr = free_loopback_addr().await?;

        let mut daemon = Command::new(&self.daemon_bin)
            .arg("--tun=userspace-networking")
            .arg(format!("--statedir={}", config.state_dir.display()))
            .arg(format!("--socket={}", socket.display()))
            .arg(format!("--socks5-server={socks_addr}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Tunnel(format!("failed to start mesh daemon: {e}")))?;

        wait_for_socket(&mut daemon, &socket, self.startup_timeout).await?;

        let key_file = write_auth_key(&config.state_dir, &config.auth_key).await?;
        let joined = self.join(&socket, &key_file, &config).await;
        if let Err(e) = tokio::fs::remove_file(&key_file).await {
            tracing::warn!(path = %key_file.display(), error = %e, "failed to remove mesh auth key file");
        }
        joined?;

        tracing::info!(
            hostname = %config.hostname,
            socks = %socks_addr,
            "mesh tunnel up"
        );

        Ok(Arc::new(MeshTunnel {
            hostname: config.hostname,
            socks_addr,
            _daemon: Mutex::new(daemon),
        }))
    }
}

impl UserspaceMeshConnector {
    /// Join the mesh with the key in `key_file`.
    async fn join(
        &self,
        socket: &Path,
        key_file: &Path,
        config: &TunnelConfig,
    ) -> Result<(), ProviderError> {
        let mut up = Command::new(&self.cli_bin);
        up.arg(format!("--socket={}", socket.display()))
            .arg("up")
            .arg(format!("--auth-key=file:{}", key_file.display()))
            .arg(format!("--hostname={}", config.hostname))
            .arg("--accept-dns=false");
        if !config.control_url.is_empty() {
            up.arg(format!("--login-server={}", config.control_url));
        }
        let output = up
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProviderError::Tunnel(format!("failed to run mesh client: {e}")))?;

        if !output.status.success() {
            return Err(ProviderError::Tunnel(format!(
                "joining mesh failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Tunnel backed by a running mesh daemon. Dropping it stops the daemon.
struct MeshTunnel {
    hostname: String,
    socks_addr: SocketAddr,
    _daemon: Mutex<Child>,
}

#[async_trait]
impl Tunnel for MeshTunnel {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let mut stream = TcpStream::connect(self.socks_addr).await?;
        socks5_connect(&mut stream, host, port).await?;
        Ok(Box::new(stream))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn free_loopback_addr() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    listener.local_addr()
}

async fn write_auth_key(state_dir: &Path, auth_key: &str) -> Result<PathBuf, ProviderError> {
    let path = state_dir.join(AUTH_KEY_FILE);
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&path).await?;
    let written = async {
        file.write_all(auth_key.as_bytes()).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e.into());
    }
    Ok(path)
}

/// Wait for the daemon's control socket to appear.
async fn wait_for_socket(
    daemon: &mut Child,
    path: &Path,
    timeout: Duration,
) -> Result<(), ProviderError> {
    let start = tokio::time::Instant::now();
    while !path.exists() {
        if let Some(status) = daemon.try_wait()? {
            return Err(ProviderError::Tunnel(format!("mesh daemon exited early: {status}")));
        }
        if start.elapsed() > timeout {
            return Err(ProviderError::Tunnel(format!(
                "mesh daemon socket did not appear within {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Perform a no-auth SOCKS5 CONNECT to `host:port` by domain name.
pub(crate) async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_bytes = host.as_bytes();
    if host_bytes.is_empty() || host_bytes.len() > 255 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid SOCKS5 host: {host:?}"),
        ));
    }

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x00] {
        return Err(io::Error::other(format!(
            "SOCKS5 proxy refused no-auth method: {greeting:?}"
        )));
    }

    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_bytes.len() as u8]);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        return Err(io::Error::other("malformed SOCKS5 reply"));
    }
    if reply[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS5 connect to {host}:{port} failed with code {}", reply[1]),
        ));
    }

    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(io::Error::other(format!("unknown SOCKS5 address type {other}"))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
