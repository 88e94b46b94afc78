/// 配置管理

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 中继 WebSocket 地址，连接时追加 `/{connection_id}`
    pub relay_ws_url: String,
    pub connection_id: String,
    pub reconnect_interval_secs: u64,
    pub log_level: String,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(config::Environment::default().try_parsing(true))
    }

    fn load(env: config::Environment) -> anyhow::Result<Self> {
        let cfg: Config = config::Config::builder()
            .set_default("relay_ws_url", "ws://localhost:8000/ws")?
            .set_default("connection_id", uuid::Uuid::new_v4().to_string())?
            .set_default("reconnect_interval_secs", 5)?
            .set_default("log_level", "info")?
            .add_source(env)
            .build()?
            .try_deserialize()?;

        common::utils::validate_connection_id(&cfg.connection_id)?;
        Ok(cfg)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}
