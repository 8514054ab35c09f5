//! 统一错误处理模块
//!
//! 定义订单事件管线的完整错误分类，使用 thiserror 提供良好的错误信息。
//! 业务拒绝（非法状态转移、未知实体等）与基础设施故障（Kafka、序列化）
//! 共用同一枚举，通过 `code()` 暴露稳定的错误码供日志与死信消息引用。

use thiserror::Error;

use crate::events::OrderStatus;

/// 订单事件管线错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // ==================== 状态机拒绝 ====================
    #[error("非法状态转移: {order_id} {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("未知实体: {order_id} 收到 {status} 事件但订单尚未创建")]
    UnknownEntity {
        order_id: String,
        status: OrderStatus,
    },

    // ==================== 定序器拒绝 ====================
    #[error("乱序缓冲区已满: {order_id} 容量 {capacity}，实体已冻结")]
    BufferExhausted { order_id: String, capacity: usize },

    #[error("乱序缓冲超时: {order_id} seq={sequence} 等待补洞超过 {waited_ms}ms")]
    GapTimeout {
        order_id: String,
        sequence: u64,
        waited_ms: u64,
    },

    // ==================== 发布与分发失败 ====================
    #[error("事件发布失败: {order_id} - {message}")]
    Publish { order_id: String, message: String },

    #[error("副作用处理失败: {kind} - {message}")]
    Handler { kind: String, message: String },

    // ==================== 基础设施错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 获取稳定错误码
    ///
    /// 错误码用于日志检索和死信消息分类，一经发布不可变更。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::UnknownEntity { .. } => "unknown-entity",
            Self::BufferExhausted { .. } => "buffer-exhausted",
            Self::GapTimeout { .. } => "gap-timeout",
            Self::Publish { .. } => "publish-failure",
            Self::Handler { .. } => "handler-failure",
            Self::Kafka(_) => "kafka-error",
            Self::Serialization(_) => "serialization-error",
            Self::Config(_) => "config-error",
            Self::Internal(_) => "internal-error",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有瞬时的基础设施故障值得重试：状态机拒绝重试多少次结果都一样，
    /// 缓冲区满需要等待补洞而非重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Publish { .. } | Self::Handler { .. } | Self::Kafka(_)
        )
    }
}
