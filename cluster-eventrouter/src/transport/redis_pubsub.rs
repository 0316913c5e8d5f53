use super::{Inbound, RouterMessage, Transport};
use crate::{Error, Member, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Redis Pub/Sub transport: every member listens on its own channel,
/// `{prefix}:member:{id}`.
///
/// A `PUBLISH` that reaches no subscriber means the member is gone or not
/// listening and is reported as [`Error::TransportUnavailable`].
pub struct RedisTransport {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisTransport {
    /// Connect, subscribe to the local member's channel and spawn the
    /// listener task. Messages published to this member after `start`
    /// returns are delivered on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unreachable or the subscription fails.
    pub async fn start(
        redis_url: &str,
        prefix: &str,
        local: &Member,
        cancel_token: CancellationToken,
    ) -> Result<(Arc<Self>, Inbound)> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        let channel = member_channel(prefix, &local.id);
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        tracing::debug!(%channel, "Subscribed to member channel");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let _listener = Self::spawn_pubsub_task(client, channel, pubsub, inbound_tx, cancel_token);

        let transport = Arc::new(Self {
            conn,
            prefix: prefix.to_string(),
        });
        Ok((transport, inbound_rx))
    }

    fn spawn_pubsub_task(
        client: redis::Client,
        channel: String,
        initial: PubSub,
        inbound_tx: mpsc::UnboundedSender<RouterMessage>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut pubsub = Some(initial);
            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                let conn = match pubsub.take() {
                    Some(conn) => conn,
                    None => match Self::resubscribe(&client, &channel).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!("Failed to resubscribe to {}: {}", channel, e);
                            tokio::select! {
                                _ = cancel_token.cancelled() => break,
                                _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                            }
                        }
                    },
                };

                match Self::run_pubsub_loop(conn, &inbound_tx, &cancel_token).await {
                    Ok(()) => break,
                    Err(e) => {
                        if !cancel_token.is_cancelled() {
                            tracing::warn!("Pub/Sub loop error, reconnecting: {}", e);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
            tracing::debug!(%channel, "Transport listener shutting down");
        })
    }

    async fn resubscribe(client: &redis::Client, channel: &str) -> Result<PubSub> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        tracing::debug!(%channel, "Resubscribed to member channel");
        Ok(pubsub)
    }

    /// Returns `Ok` on cancellation or when the router dropped its
    /// receiver; `Err` when the connection needs to be re-established.
    async fn run_pubsub_loop(
        mut pubsub: PubSub,
        inbound_tx: &mpsc::UnboundedSender<RouterMessage>,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(Error::connection("Pub/Sub stream ended"));
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Failed to get Pub/Sub payload: {}", e);
                            continue;
                        }
                    };
                    let message: RouterMessage = match serde_json::from_str(&payload) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!("Failed to parse router message: {}", e);
                            continue;
                        }
                    };
                    if inbound_tx.send(message).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn member_channel(prefix: &str, member_id: &str) -> String {
    format!("{}:member:{}", prefix, member_id)
}

#[async_trait]
impl Transport for RedisTransport {
    async fn send(&self, to: &Member, message: RouterMessage) -> Result<()> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(member_channel(&self.prefix, &to.id))
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::transport(&to.id, e.to_string()))?;

        if receivers == 0 {
            return Err(Error::transport(&to.id, "no subscriber on member channel"));
        }
        tracing::trace!(to = %to.id, kind = message.kind(), "Published router message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Event;
    use serial_test::serial;

    fn get_redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    #[test]
    fn test_member_channel_is_prefixed() {
        assert_eq!(member_channel("eventrouter", "a"), "eventrouter:member:a");
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_redis_transport_delivers_and_reports_missing_members() {
        let prefix = format!("test:{}", uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        let a = Member::new("a", "a:1");
        let b = Member::new("b", "b:1");

        let (transport_a, _rx_a) = RedisTransport::start(&get_redis_url(), &prefix, &a, cancel.clone())
            .await
            .unwrap();
        let (_transport_b, mut rx_b) = RedisTransport::start(&get_redis_url(), &prefix, &b, cancel.clone())
            .await
            .unwrap();

        let message = RouterMessage::Broadcast {
            event: Event {
                topic: "orders".into(),
                origin: "a".into(),
                sequence: 1,
                payload: "hello".into(),
            },
        };
        transport_a.send(&b, message.clone()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message);

        let ghost = Member::new("ghost", "ghost:1");
        assert!(matches!(
            transport_a.send(&ghost, message).await,
            Err(Error::TransportUnavailable { .. })
        ));

        cancel.cancel();
    }
}
