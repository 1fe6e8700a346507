//! Bidirectional relay between a plain connection and a cipher stream
//!
//! Runs two sibling tasks: plain→tunnel and tunnel→plain. Each direction
//! terminates on EOF or error and then half-closes the side it was feeding
//! (a FIN frame toward the tunnel, a TCP shutdown toward the plain side).
//! The relay completes when both directions have terminated.
//!
//! A transport comes back eligible for pooling only after a fully clean
//! conversation: the tunnel side delivered its FIN, the plain side reached
//! EOF normally, and no direction saw an authentication failure, transport
//! error, or idle timeout.

use crate::pool::AsyncStream;
use crate::tunnel::{CipherReadHalf, CipherStream, CipherWriteHalf, MAX_PAYLOAD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Tracks when either direction last moved data, so a one-sided quiet spell
/// (client silent during a long download) doesn't count as an idle stream.
#[derive(Clone)]
struct ActivityTracker {
    started: Instant,
    last_millis: Arc<AtomicU64>,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        self.last_millis
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Outcome of one relayed stream
#[derive(Debug, Clone, Copy)]
pub struct RelayResult {
    /// Plaintext bytes carried from the plain side into the tunnel
    pub to_tunnel: u64,
    /// Plaintext bytes carried from the tunnel to the plain side
    pub from_tunnel: u64,
    /// Whether the tunnel transport may be returned to the pool
    pub reusable: bool,
}

/// Shuttle bytes between `plain` and `tunnel` until both directions finish.
///
/// Every read honors `idle_timeout`; a window with no data aborts the stream
/// and marks it unusable. Returns the recovered transport alongside the
/// result; the caller decides, based on `reusable`, whether it goes back to
/// the pool or gets dropped.
pub async fn relay<T>(
    tunnel: CipherStream<T>,
    plain: TcpStream,
    idle_timeout: Duration,
    try_reuse: bool,
) -> (RelayResult, Option<T>)
where
    T: AsyncStream + 'static,
{
    let (tun_r, tun_w) = tunnel.into_split();
    let (plain_r, plain_w) = plain.into_split();

    let activity = ActivityTracker::new();
    let inbound = tokio::spawn(copy_plain_to_tunnel(
        plain_r,
        tun_w,
        idle_timeout,
        activity.clone(),
    ));
    let outbound = tokio::spawn(copy_tunnel_to_plain(
        tun_r,
        plain_w,
        idle_timeout,
        activity,
    ));

    let (inbound, outbound) = tokio::join!(inbound, outbound);

    let (Ok((to_tunnel, in_clean, tun_w)), Ok((from_tunnel, out_clean, tun_r))) =
        (inbound, outbound)
    else {
        return (
            RelayResult {
                to_tunnel: 0,
                from_tunnel: 0,
                reusable: false,
            },
            None,
        );
    };

    let stream = CipherStream::reunite(tun_r, tun_w);
    let reusable = try_reuse && in_clean && out_clean && !stream.is_unusable();

    trace!(to_tunnel, from_tunnel, reusable, "relay finished");

    (
        RelayResult {
            to_tunnel,
            from_tunnel,
            reusable,
        },
        Some(stream.into_inner()),
    )
}

async fn copy_plain_to_tunnel<T: AsyncStream>(
    mut plain_r: tokio::net::tcp::OwnedReadHalf,
    mut tun_w: CipherWriteHalf<T>,
    idle_timeout: Duration,
    activity: ActivityTracker,
) -> (u64, bool, CipherWriteHalf<T>) {
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
    let mut copied = 0u64;
    let mut clean = true;

    loop {
        let n = match timeout(idle_timeout, plain_r.read(&mut buf)).await {
            Err(_) => {
                if activity.idle_for() < idle_timeout {
                    // The other direction is still moving data
                    continue;
                }
                debug!("idle timeout reading local side");
                tun_w.mark_unusable();
                clean = false;
                break;
            }
            Ok(Err(e)) => {
                debug!("local read error: {}", e);
                clean = false;
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                activity.touch();
                n
            }
        };

        if tun_w.write(&buf[..n]).await.is_err() {
            clean = false;
            break;
        }
        copied += n as u64;
    }

    // Half-close toward the tunnel; the peer keeps its read side open
    if tun_w.is_unusable() {
        clean = false;
    } else if tun_w.close_write().await.is_err() {
        clean = false;
    }

    (copied, clean, tun_w)
}

async fn copy_tunnel_to_plain<T: AsyncStream>(
    mut tun_r: CipherReadHalf<T>,
    mut plain_w: tokio::net::tcp::OwnedWriteHalf,
    idle_timeout: Duration,
    activity: ActivityTracker,
) -> (u64, bool, CipherReadHalf<T>) {
    let mut buf = vec![0u8; 2 * MAX_PAYLOAD_SIZE];
    let mut copied = 0u64;
    let mut clean = false;

    loop {
        match timeout(idle_timeout, tun_r.read(&mut buf)).await {
            Err(_) => {
                if activity.idle_for() < idle_timeout {
                    continue;
                }
                debug!("idle timeout reading tunnel side");
                tun_r.mark_unusable();
                break;
            }
            Ok(Err(e)) => {
                debug!("tunnel read error: {}", e);
                break;
            }
            Ok(Ok(0)) => {
                // Orderly FIN from the peer
                clean = tun_r.saw_fin();
                break;
            }
            Ok(Ok(n)) => {
                activity.touch();
                if plain_w.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                copied += n as u64;
            }
        }
    }

    let _ = plain_w.shutdown().await;
    (copied, clean, tun_r)
}

/// Splice two plain TCP connections with independent half-closes.
///
/// Used for direct (untunneled) destinations.
pub async fn direct_relay(local: TcpStream, target: TcpStream) -> (u64, u64) {
    let (mut local_r, mut local_w) = local.into_split();
    let (mut target_r, mut target_w) = target.into_split();

    let upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut local_r, &mut target_w).await.unwrap_or(0);
        let _ = target_w.shutdown().await;
        copied
    });
    let downstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut target_r, &mut local_w).await.unwrap_or(0);
        let _ = local_w.shutdown().await;
        copied
    });

    let (up, down) = tokio::join!(upstream, downstream);
    (up.unwrap_or(0), down.unwrap_or(0))
}
