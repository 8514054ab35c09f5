//! 配置管理模块
//!
//! 支持多层配置文件加载与环境变量覆盖，提供类型安全的配置访问。

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "order-processor".to_string(),
            auto_offset_reset: "earliest".to_string(),
        }
    }
}

/// 定序器配置
#[derive(Debug, Clone, Deserialize)]
pub struct SequencerConfig {
    /// 每个实体乱序缓冲区的最大事件数，超出即拒绝并冻结实体
    pub buffer_capacity: usize,
    /// 乱序事件等待补洞的超时时间（毫秒），超时后按 gap-timeout 上报
    pub gap_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            gap_timeout_ms: 30_000,
        }
    }
}

impl SequencerConfig {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

/// 工作泳道配置
#[derive(Debug, Clone, Deserialize)]
pub struct LaneConfig {
    /// 泳道数量，同一实体按 order_id 哈希稳定落到同一泳道
    pub count: usize,
    /// 每条泳道的入队深度，队满时消费端等待形成背压
    pub queue_depth: usize,
    /// 补洞超时扫描间隔（毫秒）
    pub sweep_interval_ms: u64,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            count: 8,
            queue_depth: 256,
            sweep_interval_ms: 1_000,
        }
    }
}

/// 重试配置（发布与副作用分发共用）
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub kafka: KafkaConfig,
    pub sequencer: SequencerConfig,
    pub lanes: LaneConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（ORDER_ 前缀，如 ORDER_KAFKA_BROKERS -> kafka.brokers）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("ORDER_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{env}.toml"))).required(false),
            )
            .add_source(
                Environment::with_prefix("ORDER")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.kafka.brokers, "localhost:9092");
        assert_eq!(config.sequencer.buffer_capacity, 64);
        assert_eq!(config.lanes.count, 8);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_gap_timeout_conversion() {
        let config = SequencerConfig {
            buffer_capacity: 16,
            gap_timeout_ms: 5_000,
        };
        assert_eq!(config.gap_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_is_production() {
        let config = AppConfig {
            environment: "production".to_string(),
            ..Default::default()
        };
        assert!(config.is_production());

        let config = AppConfig {
            environment: "development".to_string(),
            ..Default::default()
        };
        assert!(!config.is_production());
    }
}
