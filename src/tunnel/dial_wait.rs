//! Reachability polling through the tunnel.
//!
//! A freshly booted workspace is unreachable until its agent joins the mesh.
//! The wait loop dials `host:port` at a fixed interval until a dial
//! succeeds or the deadline passes. Cancellation ends it early.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

use super::Tunnel;

/// Smallest time a single dial gets, even once the deadline has passed.
const MIN_DIAL_BUDGET: Duration = Duration::from_millis(250);

/// Poll interval and deadline for [`wait_for_reachable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialWaitPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

impl DialWaitPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10 * 60);

    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

impl Default for DialWaitPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_DEADLINE)
    }
}

/// Wait until `host:port` accepts a connection through `tunnel`.
///
/// The first successful connection is closed immediately. A zero deadline
/// makes exactly one attempt. Each dial is bounded by the time left before the
/// deadline and abandoned on cancellation.
pub async fn wait_for_reachable(
    tunnel: &dyn Tunnel,
    host: &str,
    port: u16,
    policy: DialWaitPolicy,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    let start = Instant::now();
    let mut attempts: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        attempts += 1;
        let budget = policy
            .deadline
            .saturating_sub(start.elapsed())
            .max(MIN_DIAL_BUDGET);
        let dialed = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            dialed = tokio::time::timeout(budget, tunnel.dial(host, port)) => dialed,
        };
        match dialed {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                tracing::info!(
                    host = %host,
                    port,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "remote endpoint reachable"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::debug!(host = %host, port, attempts, error = %e, "dial failed, retrying");
            }
            Err(_) => {
                tracing::debug!(host = %host, port, attempts, budget_ms = budget.as_millis(), "dial timed out");
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.deadline {
            return Err(ProviderError::DialTimeout {
                minutes: policy.deadline.as_secs_f64() / 60.0,
            });
        }

        let pause = policy.interval.min(policy.deadline.saturating_sub(elapsed));
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::TcpListener;

    use crate::testing::LoopbackTunnel;
    use crate::tunnel::BoxedStream;

    /// A tunnel whose dials never complete in time.
    struct HangingTunnel;

    #[async_trait]
    impl Tunnel for HangingTunnel {
        fn hostname(&self) -> &str {
            "hanging"
        }

        async fn dial(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(io::Error::new(io::ErrorKind::TimedOut, "dial hung"))
        }
    }

    fn fast(deadline_ms: u64) -> DialWaitPolicy {
        DialWaitPolicy::new(Duration::from_millis(50), Duration::from_millis(deadline_ms))
    }

    /// Reserve a loopback port with nothing listening on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn default_policy_is_one_second_ten_minutes() {
        let policy = DialWaitPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.deadline, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn reachable_target_returns_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tunnel = LoopbackTunnel::new("test".into());

        let start = Instant::now();
        wait_for_reachable(&tunnel, "ws1", port, fast(1_000), &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(tunnel.dialed_hosts(), vec!["ws1".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_target_times_out_after_deadline() {
        let port = closed_port().await;
        let tunnel = LoopbackTunnel::new("test".into());
        let policy = fast(300);

        let start = Instant::now();
        let err = wait_for_reachable(&tunnel, "ws1", port, policy, &CancellationToken::new())
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, ProviderError::DialTimeout { .. }));
        assert!(elapsed >= policy.deadline);
        assert!(elapsed < policy.deadline + policy.interval + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn timeout_reports_deadline_in_minutes() {
        let port = closed_port().await;
        let tunnel = LoopbackTunnel::new("test".into());
        let policy = DialWaitPolicy::new(Duration::from_millis(10), Duration::from_millis(30));

        let err = wait_for_reachable(&tunnel, "ws1", port, policy, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ProviderError::DialTimeout { minutes } => assert!((minutes - 0.0005).abs() < 1e-9),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_deadline_makes_a_single_attempt() {
        let port = closed_port().await;
        let tunnel = LoopbackTunnel::new("test".into());

        let err = wait_for_reachable(&tunnel, "ws1", port, fast(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DialTimeout { .. }));
        assert_eq!(tunnel.dialed_hosts().len(), 1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        wait_for_reachable(&tunnel, "ws1", open, fast(0), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn target_that_comes_up_later_is_detected() {
        let port = closed_port().await;
        let tunnel = LoopbackTunnel::new("test".into());
        let comes_up_after = Duration::from_millis(200);

        let server = tokio::spawn(async move {
            tokio::time::sleep(comes_up_after).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let start = Instant::now();
        wait_for_reachable(&tunnel, "ws1", port, fast(5_000), &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= comes_up_after);
        assert!(elapsed < comes_up_after + Duration::from_millis(50) + Duration::from_millis(250));
        assert!(tunnel.dialed_hosts().len() > 1);
        server.abort();
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let port = closed_port().await;
        let tunnel = LoopbackTunnel::new("test".into());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = wait_for_reachable(&tunnel, "ws1", port, fast(10_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn hanging_dial_is_bounded_by_deadline() {
        let policy = fast(200);

        let start = Instant::now();
        let err = wait_for_reachable(&HangingTunnel, "ws1", 2375, policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DialTimeout { .. }));
        assert!(start.elapsed() < policy.deadline + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_hanging_dial() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = wait_for_reachable(&HangingTunnel, "ws1", 2375, fast(10_000), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
