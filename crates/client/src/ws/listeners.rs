/// 按帧类型分发的监听器注册表

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// 监听器：收到对应类型的帧时以 `payload` 调用
pub type Listener = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// 订阅凭证，用于取消订阅
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub frame_type: String,
    id: u64,
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<HashMap<String, HashMap<u64, Listener>>>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅某一类型的帧
    pub async fn subscribe<F>(&self, frame_type: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let frame_type = frame_type.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut listeners = self.listeners.write().await;
        listeners
            .entry(frame_type.clone())
            .or_default()
            .insert(id, Arc::new(listener));
        debug!("监听器已订阅: type={}", frame_type);

        Subscription { frame_type, id }
    }

    /// 取消订阅，该类型没有监听器后移除整个分组
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut listeners = self.listeners.write().await;
        let Some(group) = listeners.get_mut(&subscription.frame_type) else {
            return false;
        };

        let removed = group.remove(&subscription.id).is_some();
        if group.is_empty() {
            listeners.remove(&subscription.frame_type);
        }
        if removed {
            debug!("监听器已取消订阅: type={}", subscription.frame_type);
        }
        removed
    }

    /// 分发一帧，返回调用的监听器数量
    pub async fn dispatch(&self, frame_type: &str, payload: &Value) -> usize {
        // 先复制出监听器，回调期间不持有锁
        let group: Vec<Listener> = {
            let listeners = self.listeners.read().await;
            match listeners.get(frame_type) {
                Some(group) => group.values().cloned().collect(),
                None => {
                    debug!("收到类型 {} 的帧，没有监听器", frame_type);
                    return 0;
                }
            }
        };

        debug!("分发类型 {} 的帧给 {} 个监听器", frame_type, group.len());
        for listener in &group {
            if let Err(e) = listener(payload) {
                error!("监听器处理失败: type={}, error={}", frame_type, e);
            }
        }
        group.len()
    }

    /// 当前有监听器的类型数
    #[cfg(test)]
    pub async fn type_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) -> anyhow::Result<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |payload: &Value| {
            sink.lock().unwrap().push(payload.clone());
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_subscriber_of_type() {
        let registry = ListenerRegistry::new();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        let (other, l3) = recorder();
        registry.subscribe("chat_message", l1).await;
        registry.subscribe("chat_message", l2).await;
        registry.subscribe("task_status_update", l3).await;

        let called = registry.dispatch("chat_message", &json!({"text": "hi"})).await;

        assert_eq!(called, 2);
        assert_eq!(first.lock().unwrap().as_slice(), &[json!({"text": "hi"})]);
        assert_eq!(second.lock().unwrap().len(), 1);
        assert!(other.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_empty_type() {
        let registry = ListenerRegistry::new();
        let (seen, listener) = recorder();
        let sub = registry.subscribe("chat_message", listener).await;
        assert_eq!(registry.type_count().await, 1);

        assert!(registry.unsubscribe(&sub).await);
        assert_eq!(registry.type_count().await, 0);
        assert!(!registry.unsubscribe(&sub).await);

        assert_eq!(registry.dispatch("chat_message", &Value::Null).await, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_others() {
        let registry = ListenerRegistry::new();
        let (seen, listener) = recorder();
        registry
            .subscribe("error", |_: &Value| Err(anyhow::anyhow!("boom")))
            .await;
        registry.subscribe("error", listener).await;

        assert_eq!(registry.dispatch("error", &json!({"message": "x"})).await, 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
