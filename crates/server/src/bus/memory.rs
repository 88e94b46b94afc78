/// 进程内广播总线
///
/// 基于 `tokio::sync::broadcast`，用于单 worker 部署和测试。
/// 可以模拟连接中断：切断所有现有订阅，或让接下来的若干次调用失败

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::{BroadcastBus, BusError, BusFrame, BusSubscription};

const DEFAULT_CAPACITY: usize = 1024;

struct Topics {
    senders: HashMap<String, broadcast::Sender<Vec<u8>>>,
    fail_subscribes: u32,
    reject_subscribes: u32,
    fail_publishes: u32,
}

#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<Topics>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Topics {
                senders: HashMap::new(),
                fail_subscribes: 0,
                reject_subscribes: 0,
                fail_publishes: 0,
            })),
            capacity,
        }
    }

    /// 切断所有现有订阅，订阅流随即结束
    #[cfg(test)]
    pub async fn sever(&self) {
        let mut topics = self.inner.lock().await;
        let capacity = self.capacity;
        for sender in topics.senders.values_mut() {
            *sender = broadcast::channel(capacity).0;
        }
        warn!("内存总线: 已切断所有订阅");
    }

    /// 接下来的 `n` 次订阅返回连接错误
    #[cfg(test)]
    pub async fn fail_next_subscribes(&self, n: u32) {
        self.inner.lock().await.fail_subscribes = n;
    }

    /// 接下来的 `n` 次订阅返回非连接类错误
    #[cfg(test)]
    pub async fn reject_next_subscribes(&self, n: u32) {
        self.inner.lock().await.reject_subscribes = n;
    }

    /// 接下来的 `n` 次发布返回连接错误
    #[cfg(test)]
    pub async fn fail_next_publishes(&self, n: u32) {
        self.inner.lock().await.fail_publishes = n;
    }

    /// 当前订阅者数量
    #[cfg(test)]
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.lock().await;
        topics
            .senders
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Topics {
    fn sender(&mut self, topic: &str, capacity: usize) -> &broadcast::Sender<Vec<u8>> {
        self.senders
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
    }
}

#[async_trait]
impl BroadcastBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut topics = self.inner.lock().await;
        if topics.fail_publishes > 0 {
            topics.fail_publishes -= 1;
            return Err(BusError::Transport("内存总线: 模拟发布失败".to_string()));
        }

        // 没有订阅者时 send 返回错误，总线不关心是否有人接收
        let receivers = topics
            .sender(topic, self.capacity)
            .send(payload.into_bytes())
            .unwrap_or(0);
        debug!("内存总线: 发布到 {}，订阅者 {} 个", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription, BusError> {
        let mut topics = self.inner.lock().await;
        if topics.fail_subscribes > 0 {
            topics.fail_subscribes -= 1;
            return Err(BusError::Transport("内存总线: 模拟订阅失败".to_string()));
        }
        if topics.reject_subscribes > 0 {
            topics.reject_subscribes -= 1;
            return Err(BusError::Unsupported("内存总线: 模拟订阅被拒绝".to_string()));
        }

        let receiver = topics.sender(topic, self.capacity).subscribe();
        let topic = topic.to_string();
        let ack = stream::once(futures_util::future::ready(BusFrame::Subscribed {
            topic: topic.clone(),
        }));

        let messages = stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((BusFrame::Message { topic, payload }, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("内存总线: 订阅者落后，丢弃 {} 条消息", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(ack.chain(messages).boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = MemoryBus::new();
        assert!(bus.publish("t", "hello".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_acks_then_delivers() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("t").await.unwrap();
        assert_eq!(
            sub.next().await,
            Some(BusFrame::Subscribed { topic: "t".to_string() })
        );

        bus.publish("t", "hello".to_string()).await.unwrap();
        bus.publish("other", "ignored".to_string()).await.unwrap();
        assert_eq!(
            sub.next().await,
            Some(BusFrame::Message { topic: "t".to_string(), payload: b"hello".to_vec() })
        );
    }

    #[tokio::test]
    async fn test_sever_ends_subscription() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("t").await.unwrap();
        sub.next().await; // ack
        assert_eq!(bus.subscriber_count("t").await, 1);

        bus.sever().await;
        let next = tokio::time::timeout(Duration::from_secs(1), sub.next()).await.unwrap();
        assert_eq!(next, None);
        assert_eq!(bus.subscriber_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = MemoryBus::new();
        bus.fail_next_subscribes(1).await;
        bus.fail_next_publishes(1).await;

        assert!(matches!(bus.subscribe("t").await, Err(BusError::Transport(_))));
        assert!(bus.subscribe("t").await.is_ok());
        assert!(bus.publish("t", "x".to_string()).await.unwrap_err().is_transport());
        assert!(bus.publish("t", "x".to_string()).await.is_ok());

        bus.reject_next_subscribes(1).await;
        match bus.subscribe("t").await {
            Err(err) => assert!(!err.is_transport()),
            Ok(_) => panic!("不应订阅成功"),
        }
        assert!(bus.subscribe("t").await.is_ok());
    }
}
