//! Loopback listener that forwards each accepted connection through the
//! tunnel to a fixed `host:port`, for clients that can only dial TCP.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::Tunnel;

pub struct LoopbackBridge {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl LoopbackBridge {
    pub async fn start(tunnel: Arc<dyn Tunnel>, host: String, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            loop {
                let (mut local, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!(error = %e, "bridge accept failed");
                        continue;
                    }
                };
                let tunnel = tunnel.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    let mut remote = match tunnel.dial(&host, port).await {
                        Ok(remote) => remote,
                        Err(e) => {
                            tracing::debug!(host = %host, port, error = %e, "bridge dial failed");
                            return;
                        }
                    };
                    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                        tracing::debug!(error = %e, "bridge connection closed with error");
                    }
                });
            }
        });

        Ok(Self { addr, task })
    }

    /// Local address clients connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LoopbackBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::testing::LoopbackTunnel;

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn bridge_forwards_through_tunnel() {
        let port = echo_server().await;
        let tunnel = Arc::new(LoopbackTunnel::new("test".into()));
        let bridge = LoopbackBridge::start(tunnel.clone(), "ws1".into(), port)
            .await
            .unwrap();

        let mut conn = TcpStream::connect(bridge.addr()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(tunnel.dialed_hosts(), vec!["ws1".to_string()]);

        bridge.stop();
    }

    #[tokio::test]
    async fn stopped_bridge_refuses_connections() {
        let port = echo_server().await;
        let tunnel = Arc::new(LoopbackTunnel::new("test".into()));
        let bridge = LoopbackBridge::start(tunnel, "ws1".into(), port).await.unwrap();
        let addr = bridge.addr();
        bridge.stop();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn dropped_bridge_refuses_connections() {
        let port = echo_server().await;
        let tunnel = Arc::new(LoopbackTunnel::new("test".into()));
        let bridge = LoopbackBridge::start(tunnel, "ws1".into(), port).await.unwrap();
        let addr = bridge.addr();
        drop(bridge);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
