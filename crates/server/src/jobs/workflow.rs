/// 会话工作流
///
/// 真正的多智能体逻辑不在本服务内，这里只定义边界和一个模拟实现

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::JobError;

/// 工作流：按会话 ID 和参数执行一次，返回结果
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(&self, session_id: Uuid, params: &Value) -> Result<Value, JobError>;
}

/// 模拟工作流：等待一段时间后返回固定结果
pub struct SimulatedWorkflow {
    duration: Duration,
}

impl SimulatedWorkflow {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Workflow for SimulatedWorkflow {
    async fn run(&self, session_id: Uuid, params: &Value) -> Result<Value, JobError> {
        info!("[{}] 开始执行工作流，参数: {}", session_id, params);
        tokio::time::sleep(self.duration).await;
        info!("[{}] 工作流（模拟）已完成", session_id);
        Ok(json!({"status": "completed", "result": "simulated_ok"}))
    }
}
