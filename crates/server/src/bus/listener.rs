/// 总线监听任务
///
/// 每个 worker 只运行一个，是本 worker 所有连接唯一的跨进程投递通道。
/// 状态: Subscribing -> Listening -> (Delivering) -> Listening ...，
/// 连接中断时 Reconnecting -> Subscribing，取消时 Stopped。
/// 除了显式取消之外不会退出

use common::{utils::truncate_for_log, Envelope};
use futures_util::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{BusFrame, BusSubscription, SharedBus};
use crate::config::Config;
use crate::ws::ConnectionRegistry;

/// 监听状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Subscribing,
    Listening,
    Delivering,
    Reconnecting,
    Stopped,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribing => "subscribing",
            Self::Listening => "listening",
            Self::Delivering => "delivering",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条总线消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 已写入本地连接
    Delivered,
    /// 目标不在本 worker
    NotLocal,
    /// 信封无法解码，已丢弃
    Malformed,
    /// 写入本地连接失败，表项留给连接处理器清理
    WriteFailed,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub topic: String,
    /// 单次等待消息的上限，保证空闲时也能及时响应取消
    pub poll_timeout: Duration,
    /// 连接中断后重新订阅前的固定等待
    pub reconnect_delay: Duration,
}

impl From<&Config> for ListenerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            topic: cfg.redis_channel.clone(),
            poll_timeout: cfg.listener_poll_timeout(),
            reconnect_delay: cfg.listener_reconnect_delay(),
        }
    }
}

enum ListenExit {
    Cancelled,
    StreamEnded,
}

pub struct BusListener {
    bus: SharedBus,
    registry: ConnectionRegistry,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl BusListener {
    pub fn new(bus: SharedBus, registry: ConnectionRegistry, config: ListenerConfig) -> Self {
        let (state, _) = watch::channel(ListenerState::Subscribing);
        Self {
            bus,
            registry,
            config,
            state,
        }
    }

    /// 订阅状态变化
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    /// 运行直到被取消
    pub async fn run(self, cancel: CancellationToken) {
        let topic = self.config.topic.clone();
        info!("🎧 总线监听启动: backend={}, topic={}", self.bus.name(), topic);

        loop {
            self.set_state(ListenerState::Subscribing);
            let subscription = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.bus.subscribe(&topic) => result,
            };

            match subscription {
                Ok(stream) => match self.listen(stream, &cancel).await {
                    ListenExit::Cancelled => break,
                    ListenExit::StreamEnded => warn!("总线订阅中断: topic={}", topic),
                },
                Err(e) if e.is_transport() => warn!("总线订阅失败: {}", e),
                Err(e) => error!("总线订阅出现意外错误: {}", e),
            }

            self.set_state(ListenerState::Reconnecting);
            warn!("{}ms 后重新订阅...", self.config.reconnect_delay.as_millis());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(ListenerState::Stopped);
        info!("总线监听已停止: topic={}", topic);
    }

    async fn listen(&self, mut stream: BusSubscription, cancel: &CancellationToken) -> ListenExit {
        self.set_state(ListenerState::Listening);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return ListenExit::Cancelled,
                next = tokio::time::timeout(self.config.poll_timeout, stream.next()) => next,
            };

            match next {
                // 超时只是空闲，继续等待
                Err(_) => trace!("总线空闲"),
                Ok(None) => return ListenExit::StreamEnded,
                Ok(Some(BusFrame::Subscribed { topic })) => {
                    info!("✅ 已订阅总线: {}", topic);
                }
                Ok(Some(BusFrame::Message { payload, .. })) => {
                    self.set_state(ListenerState::Delivering);
                    self.deliver(&payload).await;
                    self.set_state(ListenerState::Listening);
                }
            }
        }
    }

    /// 处理一条总线消息
    pub async fn deliver(&self, payload: &[u8]) -> DeliveryOutcome {
        let envelope = match Envelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "总线消息解码失败，已丢弃: {} ({})",
                    e,
                    truncate_for_log(&String::from_utf8_lossy(payload), 200)
                );
                return DeliveryOutcome::Malformed;
            }
        };

        let Some(connection) = self.registry.lookup(&envelope.target).await else {
            trace!("目标不在本 worker: {}", envelope.target);
            return DeliveryOutcome::NotLocal;
        };

        match connection.send_text(envelope.message) {
            Ok(()) => {
                debug!("📨 已投递到本地连接: {}", envelope.target);
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!("投递到本地连接失败: target={}, error={}", envelope.target, e);
                DeliveryOutcome::WriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BroadcastBus, MemoryBus, PublishGateway};
    use crate::ws::registry::OutboundFrame;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const TOPIC: &str = "ws_messages";

    fn test_config() -> ListenerConfig {
        ListenerConfig {
            topic: TOPIC.to_string(),
            poll_timeout: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(50),
        }
    }

    struct Worker {
        registry: ConnectionRegistry,
        state: watch::Receiver<ListenerState>,
        task: JoinHandle<()>,
    }

    fn spawn_worker(bus: &MemoryBus, cancel: &CancellationToken) -> Worker {
        let registry = ConnectionRegistry::new();
        let listener = BusListener::new(Arc::new(bus.clone()), registry.clone(), test_config());
        let state = listener.state();
        let task = tokio::spawn(listener.run(cancel.child_token()));
        Worker { registry, state, task }
    }

    async fn wait_for_subscribers(bus: &MemoryBus, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.subscriber_count(TOPIC).await != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待订阅超时");
    }

    async fn recv_text(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> String {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(OutboundFrame::Text(text))) => text,
            other => panic!("期望文本消息，收到 {:?}", other),
        }
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) {
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "不应收到消息: {:?}", got);
    }

    fn gateway(bus: &MemoryBus) -> PublishGateway {
        PublishGateway::new(Arc::new(bus.clone()), TOPIC)
    }

    #[tokio::test]
    async fn test_delivers_only_to_local_targets() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let worker = spawn_worker(&bus, &cancel);
        wait_for_subscribers(&bus, 1).await;

        let (tx, mut stream_a) = mpsc::unbounded_channel();
        worker.registry.register("abc".to_string(), tx).await;

        let gateway = gateway(&bus);
        gateway.publish("abc", "hello").await.unwrap();
        assert_eq!(recv_text(&mut stream_a).await, "hello");

        gateway.publish("xyz", "hi").await.unwrap();
        assert_silent(&mut stream_a).await;
        assert!(!worker.task.is_finished());

        cancel.cancel();
        worker.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exactly_one_worker_delivers() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let w1 = spawn_worker(&bus, &cancel);
        let w2 = spawn_worker(&bus, &cancel);
        wait_for_subscribers(&bus, 2).await;

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        w1.registry.register("on-w1".to_string(), tx1).await;
        w2.registry.register("on-w2".to_string(), tx2).await;

        gateway(&bus).publish("on-w2", "for w2").await.unwrap();
        assert_eq!(recv_text(&mut rx2).await, "for w2");
        assert_silent(&mut rx2).await;
        assert_silent(&mut rx1).await;

        cancel.cancel();
        w1.task.await.unwrap();
        w2.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_survives_malformed_envelope() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let worker = spawn_worker(&bus, &cancel);
        wait_for_subscribers(&bus, 1).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.registry.register("abc".to_string(), tx).await;

        bus.publish(TOPIC, "{not json".to_string()).await.unwrap();
        bus.publish(TOPIC, r#"{"target":"abc"}"#.to_string()).await.unwrap();
        gateway(&bus).publish("abc", "still alive").await.unwrap();

        assert_eq!(recv_text(&mut rx).await, "still alive");
        cancel.cancel();
        worker.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_transport_drop() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let mut worker = spawn_worker(&bus, &cancel);
        wait_for_subscribers(&bus, 1).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.registry.register("abc".to_string(), tx).await;

        // 断开后第一次重新订阅也失败
        bus.fail_next_subscribes(1).await;
        bus.sever().await;
        wait_for_subscribers(&bus, 1).await;

        gateway(&bus).publish("abc", "after reconnect").await.unwrap();
        assert_eq!(recv_text(&mut rx).await, "after reconnect");
        tokio::time::timeout(
            Duration::from_secs(1),
            worker.state.wait_for(|s| *s == ListenerState::Listening),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        worker.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_shaped_envelope_is_dropped() {
        let bus = MemoryBus::new();
        let registry = ConnectionRegistry::new();
        let listener = BusListener::new(Arc::new(bus), registry.clone(), test_config());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("abc".to_string(), tx).await;

        assert_eq!(
            listener.deliver(br#"["abc","hello"]"#).await,
            DeliveryOutcome::Malformed
        );
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_unexpected_subscribe_error() {
        let bus = MemoryBus::new();
        bus.reject_next_subscribes(1).await;

        let registry = ConnectionRegistry::new();
        let config = ListenerConfig {
            reconnect_delay: Duration::from_millis(200),
            ..test_config()
        };
        let listener = BusListener::new(Arc::new(bus.clone()), registry.clone(), config);
        let mut state = listener.state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ListenerState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(bus.subscriber_count(TOPIC).await, 0);

        wait_for_subscribers(&bus, 1).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("abc".to_string(), tx).await;
        gateway(&bus).publish("abc", "after retry").await.unwrap();
        assert_eq!(recv_text(&mut rx).await, "after retry");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_leaves_entry() {
        let bus = MemoryBus::new();
        let registry = ConnectionRegistry::new();
        let listener = BusListener::new(Arc::new(bus), registry.clone(), test_config());

        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("gone".to_string(), tx).await;
        drop(rx);

        let payload = Envelope::new("gone", "late").to_json().unwrap();
        assert_eq!(listener.deliver(payload.as_bytes()).await, DeliveryOutcome::WriteFailed);
        assert!(registry.lookup("gone").await.is_some());

        let payload = Envelope::new("nobody", "x").to_json().unwrap();
        assert_eq!(listener.deliver(payload.as_bytes()).await, DeliveryOutcome::NotLocal);
        assert_eq!(listener.deliver(b"[]").await, DeliveryOutcome::Malformed);
    }

    #[tokio::test]
    async fn test_stops_promptly_on_cancel_while_backing_off() {
        let bus = MemoryBus::new();
        bus.fail_next_subscribes(u32::MAX).await;

        let registry = ConnectionRegistry::new();
        let config = ListenerConfig {
            reconnect_delay: Duration::from_secs(60),
            ..test_config()
        };
        let listener = BusListener::new(Arc::new(bus), registry, config);
        let mut state = listener.state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ListenerState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ListenerState::Stopped);
    }
}
