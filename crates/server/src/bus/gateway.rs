/// 发布网关
///
/// 任何 worker 都可以通过网关向任意连接发送消息，只负责把信封交给总线，
/// 不确认目标是否在线

use common::Envelope;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BusError, SharedBus};

#[derive(Clone)]
pub struct PublishGateway {
    bus: SharedBus,
    topic: Arc<str>,
}

impl PublishGateway {
    pub fn new(bus: SharedBus, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: Arc::from(topic.into()),
        }
    }

    /// 向目标连接发布一条消息
    pub async fn publish(&self, target: &str, message: impl Into<String>) -> Result<(), BusError> {
        let payload = Envelope::new(target, message).to_json()?;

        match self.bus.publish(&self.topic, payload).await {
            Ok(()) => {
                debug!("📤 消息已发布: target={}, topic={}", target, self.topic);
                Ok(())
            }
            Err(e) => {
                warn!("发布消息失败: target={}, backend={}, error={}", target, self.bus.name(), e);
                Err(e)
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}
