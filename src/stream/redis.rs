//! Redis Streams backend.
//!
//! Uses `redis::aio::ConnectionManager`, which reconnects on its own; a failed
//! call surfaces as a `StreamError` and the next call retries the connection.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, ConnectionInfo, Value};
use tracing::{debug, info, warn};

use super::{GroupBootstrap, StreamError, StreamItem, StreamStore};

#[derive(Clone)]
pub struct RedisStreams {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreams")
            .field("conn", &"ConnectionManager")
            .finish()
    }
}

impl RedisStreams {
    pub async fn connect(info: ConnectionInfo) -> Result<Self, StreamError> {
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        debug!("redis connection manager ready");
        Ok(Self { conn })
    }

    async fn create_group(&self, stream: &str, group: &str, mkstream: bool) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        if mkstream {
            conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$").await
        } else {
            conn.xgroup_create::<_, _, _, ()>(stream, group, "$").await
        }
    }
}

fn is_busy_group(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
}

fn is_missing_key(e: &redis::RedisError) -> bool {
    e.to_string().to_lowercase().contains("no such key")
}

/// First entry of an XREADGROUP reply, with every field decoded as a string.
fn first_item(reply: StreamReadReply) -> Option<StreamItem> {
    let entry = reply.keys.into_iter().flat_map(|k| k.ids).next()?;
    let fields: BTreeMap<String, String> = entry
        .map
        .iter()
        .map(|(k, v)| (k.clone(), field_text(&entry.id, k, v)))
        .collect();
    Some(StreamItem::new(entry.id, fields))
}

// Invalid UTF-8 is decoded lossily; values that are not strings at all read as "".
fn field_text(id: &str, field: &str, value: &Value) -> String {
    match value {
        Value::BulkString(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                warn!(id, field, "stream field is not valid UTF-8, decoding lossily");
                String::from_utf8_lossy(bytes).into_owned()
            }
        },
        other => redis::from_redis_value::<String>(other).unwrap_or_else(|e| {
            warn!(id, field, error = %e, "stream field is not a string, reading as empty");
            String::new()
        }),
    }
}

#[async_trait]
impl StreamStore for RedisStreams {
    async fn ping(&self) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupBootstrap, StreamError> {
        match self.create_group(stream, group, true).await {
            Ok(()) => {
                info!(stream, group, "consumer group created");
                Ok(GroupBootstrap::Created)
            }
            Err(e) if is_busy_group(&e) => {
                info!(stream, group, "consumer group already exists");
                Ok(GroupBootstrap::AlreadyExists)
            }
            Err(e) if is_missing_key(&e) => {
                let mut conn = self.conn.clone();
                conn.xadd::<_, _, _, _, String>(stream, "*", &[("init", "init")])
                    .await?;
                match self.create_group(stream, group, false).await {
                    Ok(()) => {}
                    Err(e) if is_busy_group(&e) => return Ok(GroupBootstrap::AlreadyExists),
                    Err(e) => return Err(e.into()),
                }
                info!(stream, group, "consumer group created with new stream");
                Ok(GroupBootstrap::CreatedWithStream)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamItem>, StreamError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block.as_millis() as usize);
        // A timed-out block comes back as nil, which decodes to `None`.
        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &opts).await?;
        Ok(reply.and_then(first_item))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, i64>(stream, group, &[id]).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StreamError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }
}
