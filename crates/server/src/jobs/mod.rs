/// 后台任务队列
///
/// 进程内执行会话工作流：并发上限、单次超时、失败重试。
/// 任务结束后通过发布网关把最终状态推送给会话对应的连接

pub mod workflow;

use chrono::{DateTime, Utc};
use common::ClientFrame;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::PublishGateway;
use crate::config::Config;

pub use workflow::{SimulatedWorkflow, Workflow};

/// 推送给客户端的任务状态帧类型
pub const TASK_STATUS_FRAME_TYPE: &str = "task_status_update";

/// 任务错误
#[derive(Debug, Error)]
pub enum JobError {
    #[error("任务超时（{0:?}）")]
    Timeout(Duration),

    #[error("任务执行失败: {0}")]
    Failed(String),

    #[error("任务不存在: {0}")]
    NotFound(Uuid),
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub session_id: Uuid,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_tries: u32,
    pub params: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl JobRecord {
    /// 已结束且超过保留时长
    fn is_expired(&self, retention: Duration) -> bool {
        self.status.is_finished()
            && self
                .finished_at
                .is_some_and(|finished| finished.elapsed() >= retention)
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// 同时运行的任务上限
    pub max_jobs: usize,
    /// 单次执行超时
    pub timeout: Duration,
    /// 最多尝试次数（含第一次）
    pub max_tries: u32,
    /// 已结束任务记录的保留时长
    pub retention: Duration,
}

impl From<&Config> for JobQueueConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            max_jobs: cfg.max_jobs,
            timeout: cfg.job_timeout(),
            max_tries: cfg.job_max_tries,
            retention: cfg.job_retention(),
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    workflow: Arc<dyn Workflow>,
    gateway: PublishGateway,
    jobs: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
    permits: Arc<Semaphore>,
    config: JobQueueConfig,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(
        workflow: Arc<dyn Workflow>,
        gateway: PublishGateway,
        config: JobQueueConfig,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            workflow,
            gateway,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(config.max_jobs)),
            config,
            tracker,
            shutdown,
        }
    }

    /// 提交任务，立即返回任务 ID
    pub async fn enqueue(&self, session_id: Uuid, params: Value) -> Uuid {
        let job_id = Uuid::new_v4();
        let record = JobRecord {
            job_id,
            session_id,
            status: JobStatus::Queued,
            attempts: 0,
            max_tries: self.config.max_tries,
            params: params.clone(),
            result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            finished_at: None,
        };
        {
            let mut jobs = self.jobs.write().await;
            self.prune_expired(&mut jobs);
            jobs.insert(job_id, record);
        }
        info!("任务已入队: job_id={}, session_id={}", job_id, session_id);

        let queue = self.clone();
        self.tracker
            .spawn(async move { queue.execute(job_id, session_id, params).await });
        job_id
    }

    /// 清理过期的已结束任务
    fn prune_expired(&self, jobs: &mut HashMap<Uuid, JobRecord>) {
        let before = jobs.len();
        jobs.retain(|_, record| !record.is_expired(self.config.retention));
        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!("已清理 {} 条过期任务记录", pruned);
        }
    }

    /// 查询任务
    pub async fn get(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id).cloned().ok_or(JobError::NotFound(job_id))
    }

    async fn execute(self, job_id: Uuid, session_id: Uuid, params: Value) {
        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.finish(job_id, Err("worker 正在关闭，任务未执行".to_string())).await;
            return;
        };

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_tries {
            self.mark_running(job_id, attempt).await;

            let run = tokio::time::timeout(self.config.timeout, self.workflow.run(session_id, &params));
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.finish(job_id, Err("worker 正在关闭，任务已中止".to_string())).await;
                    return;
                }
                outcome = run => outcome,
            };

            match outcome {
                Ok(Ok(result)) => {
                    self.finish(job_id, Ok(result)).await;
                    return;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = JobError::Timeout(self.config.timeout).to_string(),
            }
            warn!(
                "任务第 {}/{} 次执行失败: job_id={}, error={}",
                attempt, self.config.max_tries, job_id, last_error
            );
        }

        self.finish(job_id, Err(last_error)).await;
    }

    async fn mark_running(&self, job_id: Uuid, attempt: u32) {
        let mut jobs = self.jobs.write().await;
        if let Some(record) = jobs.get_mut(&job_id) {
            record.status = JobStatus::Running;
            record.attempts = attempt;
            record.started_at.get_or_insert_with(Utc::now);
        }
    }

    async fn finish(&self, job_id: Uuid, outcome: Result<Value, String>) {
        let record = {
            let mut jobs = self.jobs.write().await;
            let Some(record) = jobs.get_mut(&job_id) else {
                return;
            };
            match outcome {
                Ok(result) => {
                    record.status = JobStatus::Completed;
                    record.result = Some(result);
                }
                Err(e) => {
                    record.status = JobStatus::Failed;
                    record.error_message = Some(e);
                }
            }
            record.completed_at = Some(Utc::now());
            record.finished_at = Some(Instant::now());
            record.clone()
        };

        match record.status {
            JobStatus::Completed => info!("任务已完成: job_id={}", job_id),
            _ => error!(
                "任务失败: job_id={}, error={}",
                job_id,
                record.error_message.as_deref().unwrap_or("")
            ),
        }
        self.publish_status(&record).await;
    }

    /// 把最终状态推送给会话对应的连接
    async fn publish_status(&self, record: &JobRecord) {
        let frame = ClientFrame::new(
            TASK_STATUS_FRAME_TYPE,
            json!({
                "task_id": record.job_id,
                "session_id": record.session_id,
                "status": record.status,
                "result": record.result,
                "message": record.error_message,
            }),
        );
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("序列化任务状态失败: {}", e);
                return;
            }
        };

        if let Err(e) = self.gateway.publish(&record.session_id.to_string(), text).await {
            warn!("推送任务状态失败: job_id={}, error={}", record.job_id, e);
        }
    }
}
