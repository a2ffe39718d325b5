//! Lazily (re)connected Redis handle shared by the Redis-backed collaborators.

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tokio::sync::Mutex;

/// Redis client plus a cached multiplexed connection.
///
/// Constructing the handle only parses the URL. The first command opens one TCP
/// connection, which is then shared (multiplexed) by every caller. A caller that
/// observes a transport error calls [`reset`](Self::reset) so the next command
/// reconnects.
#[derive(Debug)]
pub struct RedisHandle {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisHandle {
    pub fn open(url: &str) -> RedisResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
            conn: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Cached connection, connecting first if needed.
    pub async fn connection(&self) -> RedisResult<MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection.
    pub async fn reset(&self) {
        self.conn.lock().await.take();
    }
}
