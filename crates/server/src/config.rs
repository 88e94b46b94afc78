/// 配置管理
///
/// 默认值 + 环境变量（`.env` 由 dotenvy 预先加载）

use serde::Deserialize;
use std::time::Duration;

/// 广播总线后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// Redis Pub/Sub，多 worker 部署
    Redis,
    /// 进程内广播，单 worker 部署
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub bus_backend: BusBackend,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_channel: String,
    pub echo_prefix: String,
    pub listener_poll_timeout_ms: u64,
    pub listener_reconnect_delay_ms: u64,
    pub max_jobs: usize,
    pub job_timeout_secs: u64,
    pub job_max_tries: u32,
    pub job_simulated_duration_ms: u64,
    pub job_retention_secs: u64,
    pub shutdown_grace_secs: u64,
    pub log_level: String,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(config::Environment::default().try_parsing(true))
    }

    fn load(env: config::Environment) -> anyhow::Result<Self> {
        let cfg: Config = config::Config::builder()
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 8000)?
            .set_default("bus_backend", "redis")?
            .set_default("redis_host", "localhost")?
            .set_default("redis_port", 6379)?
            .set_default("redis_channel", "ws_messages")?
            .set_default("echo_prefix", common::relay::frame::DEFAULT_ECHO_PREFIX)?
            .set_default("listener_poll_timeout_ms", 1000)?
            .set_default("listener_reconnect_delay_ms", 5000)?
            .set_default("max_jobs", 5)?
            .set_default("job_timeout_secs", 8 * 60 * 60)?
            .set_default("job_max_tries", 3)?
            .set_default("job_simulated_duration_ms", 5000)?
            .set_default("job_retention_secs", 60 * 60)?
            .set_default("shutdown_grace_secs", 10)?
            .set_default("log_level", "debug")?
            .add_source(env)
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.redis_channel.trim().is_empty() {
            anyhow::bail!("REDIS_CHANNEL 不能为空");
        }
        if self.listener_poll_timeout_ms == 0 {
            anyhow::bail!("LISTENER_POLL_TIMEOUT_MS 必须大于 0");
        }
        if self.max_jobs == 0 {
            anyhow::bail!("MAX_JOBS 必须大于 0");
        }
        if self.job_max_tries == 0 {
            anyhow::bail!("JOB_MAX_TRIES 必须大于 0");
        }
        Ok(())
    }

    /// Redis 连接地址
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn listener_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_poll_timeout_ms)
    }

    pub fn listener_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.listener_reconnect_delay_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
