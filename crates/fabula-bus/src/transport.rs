//! Transport seam for the event bus.
//!
//! Production uses Redis pub/sub (one channel per event type under the
//! `fabula.events.` prefix); tests use the in-memory transport. The bus only
//! ever talks to the trait.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

use crate::error::{BusError, Result};

/// Channel prefix on the wire. The event type is appended verbatim.
pub const CHANNEL_PREFIX: &str = "fabula.events.";

#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Deliver one serialized event to `channel`. Must preserve per-caller
    /// publish order.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a firehose subscription over every bus channel. The returned
    /// receiver yields `(channel, payload)` pairs until the transport dies.
    async fn subscribe_all(&self) -> Result<mpsc::Receiver<(String, String)>>;

    /// Cheap liveness check used by the health probe.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

pub struct RedisTransport {
    client: redis::Client,
    /// Cached multiplexed connection; dropped on error so the next call
    /// reconnects.
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisTransport {
    pub fn new(uri: &str, password: Option<&str>) -> Result<Self> {
        let url = connection_url(uri, password);
        let client = redis::Client::open(url.as_str())?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }
}

/// Splice a password into the URI when one is configured separately and the
/// URI itself carries no credentials.
fn connection_url(uri: &str, password: Option<&str>) -> String {
    match password {
        Some(pass) if !uri.contains('@') => match uri.strip_prefix("redis://") {
            Some(rest) => format!("redis://:{}@{}", pass, rest),
            None => uri.to_string(),
        },
        _ => uri.to_string(),
    }
}

#[async_trait]
impl BusTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: std::result::Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            self.invalidate().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<mpsc::Receiver<(String, String)>> {
        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();
        let pattern = format!("{}*", CHANNEL_PREFIX);

        tokio::spawn(async move {
            // Reconnect loop: pub/sub connections die silently on broker
            // restarts, so resubscribe with a flat 5 s pause between tries.
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe(&pattern).await {
                            warn!(error = %e, "psubscribe failed");
                        } else {
                            info!(pattern = %pattern, "bus subscription established");
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let channel = msg.get_channel_name().to_string();
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        warn!(error = %e, "non-utf8 bus payload dropped");
                                        continue;
                                    }
                                };
                                if tx.send((channel, payload)).await.is_err() {
                                    return; // bus gone, stop the pump
                                }
                            }
                            warn!("bus subscription stream ended, reconnecting");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "bus subscription connect failed");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: std::result::Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.invalidate().await;
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory (tests, single-process deployments)
// ---------------------------------------------------------------------------

/// Loopback transport with the same at-least-once shape as Redis pub/sub.
/// `set_failing(true)` simulates a broker outage for outage-path tests.
pub struct MemoryTransport {
    tx: broadcast::Sender<(String, String)>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self {
            tx,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BusError::Transport("transport unreachable".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.check_up()?;
        // No receivers is fine: pub/sub drops messages nobody listens to.
        let _ = self.tx.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<mpsc::Receiver<(String, String)>> {
        let (out_tx, out_rx) = mpsc::channel(1024);
        let mut sub = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(pair) => {
                        if out_tx.send(pair).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "in-memory subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(out_rx)
    }

    async fn ping(&self) -> Result<()> {
        self.check_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_spliced_into_bare_uri() {
        assert_eq!(
            connection_url("redis://localhost:6379/", Some("s3cret")),
            "redis://:s3cret@localhost:6379/"
        );
        // URIs that already carry credentials are left alone.
        assert_eq!(
            connection_url("redis://:x@localhost/", Some("s3cret")),
            "redis://:x@localhost/"
        );
        assert_eq!(connection_url("redis://localhost/", None), "redis://localhost/");
    }

    #[tokio::test]
    async fn memory_transport_round_trips() {
        let t = MemoryTransport::new();
        let mut rx = t.subscribe_all().await.unwrap();
        // Subscription task needs a tick to attach before the first publish.
        tokio::task::yield_now().await;

        t.publish("fabula.events.test", "{\"a\":1}").await.unwrap();
        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, "fabula.events.test");
        assert_eq!(payload, "{\"a\":1}");
    }

    #[tokio::test]
    async fn failing_memory_transport_rejects() {
        let t = MemoryTransport::new();
        t.set_failing(true);
        assert!(t.ping().await.is_err());
        assert!(t.publish("c", "p").await.is_err());
        t.set_failing(false);
        assert!(t.ping().await.is_ok());
    }
}
