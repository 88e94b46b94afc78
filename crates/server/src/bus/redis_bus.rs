/// Redis Pub/Sub 总线
///
/// 发布走懒加载的 `ConnectionManager`（自动重连）；每次订阅单独建立一条
/// pub/sub 连接，连接断开时订阅流结束，由监听任务负责重新订阅

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BroadcastBus, BusError, BusFrame, BusSubscription};

pub struct RedisBus {
    client: redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
}

impl RedisBus {
    /// 创建总线（不会立即建立连接）
    pub fn new(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(transport)?;
        info!("Redis 总线已配置: {}", url);
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    /// 获取发布连接，首次调用时建立
    async fn publisher(&self) -> Result<ConnectionManager, BusError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_connection_manager().await.map_err(transport)?;
        info!("✅ Redis 发布连接已建立");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

fn transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

#[async_trait]
impl BroadcastBus for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher().await?;
        let receivers: i64 = conn.publish(topic, payload).await.map_err(transport)?;
        debug!("Redis 发布到 {}，订阅者 {} 个", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        pubsub.subscribe(topic).await.map_err(transport)?;

        let ack = stream::once(futures_util::future::ready(BusFrame::Subscribed {
            topic: topic.to_string(),
        }));
        let messages = pubsub.into_on_message().map(|msg| BusFrame::Message {
            topic: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });

        Ok(ack.chain(messages).boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
