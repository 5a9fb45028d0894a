//! Cross-instance "role X changed" broadcast for the permission cache.

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::permission_cache::PermissionCache;
use crate::config::RedisConfig;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, role_id: Uuid) -> Result<(), anyhow::Error>;
}

/// Single-instance deployments: nothing to tell.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalInvalidationBus;

#[async_trait]
impl InvalidationBus for LocalInvalidationBus {
    async fn publish(&self, _role_id: Uuid) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub origin: Uuid,
    pub role_id: Uuid,
}

/// Returns the role to invalidate, or `None` for our own or malformed messages.
pub fn decode_message(payload: &str, own_origin: Uuid) -> Option<Uuid> {
    match serde_json::from_str::<InvalidationMessage>(payload) {
        Ok(msg) if msg.origin == own_origin => None,
        Ok(msg) => Some(msg.role_id),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed invalidation message");
            None
        }
    }
}

#[derive(Clone)]
pub struct RedisInvalidationBus {
    client: Client,
    manager: ConnectionManager,
    channel: String,
    origin: Uuid,
}

impl RedisInvalidationBus {
    pub async fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(channel = %config.channel, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            client,
            manager,
            channel: config.channel.clone(),
            origin: Uuid::new_v4(),
        })
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }

    /// Applies other instances' invalidations to `cache` until `shutdown`
    /// flips to true. Reconnects on failure and clears the cache after each
    /// reconnect, since messages may have been missed.
    pub fn spawn_listener(
        &self,
        cache: Arc<PermissionCache>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        let origin = self.origin;

        tokio::spawn(async move {
            let mut connected_once = false;
            loop {
                if *shutdown.borrow() {
                    break;
                }

                match listen(&client, &channel, origin, &cache, &mut shutdown, connected_once).await
                {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(error = %e, channel = %channel, "Invalidation listener disconnected");
                    }
                }
                connected_once = true;

                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.changed() => {}
                }
            }
            tracing::info!("Invalidation listener stopped");
        })
    }
}

/// Returns Ok only on shutdown.
async fn listen(
    client: &Client,
    channel: &str,
    origin: Uuid,
    cache: &PermissionCache,
    shutdown: &mut watch::Receiver<bool>,
    reconnecting: bool,
) -> Result<(), anyhow::Error> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(channel = %channel, "Subscribed to permission invalidations");

    if reconnecting {
        cache.invalidate_all();
    }

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            msg = messages.next() => {
                let msg = msg.ok_or_else(|| anyhow::anyhow!("Invalidation stream closed"))?;
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Unreadable invalidation payload");
                        continue;
                    }
                };
                if let Some(role_id) = decode_message(&payload, origin) {
                    cache.apply_remote_invalidation(role_id);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl InvalidationBus for RedisInvalidationBus {
    async fn publish(&self, role_id: Uuid) -> Result<(), anyhow::Error> {
        let payload = serde_json::to_string(&InvalidationMessage {
            origin: self.origin,
            role_id,
        })?;

        let mut conn = self.manager.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to publish invalidation: {}", e))?;

        tracing::debug!(role_id = %role_id, receivers, "Published permission invalidation");
        Ok(())
    }
}
