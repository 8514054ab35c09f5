//! 共享库
//!
//! 包含订单事件管线各组件共用的配置、错误处理、事件模型、Kafka 封装、
//! 重试策略与死信队列等基础设施代码。

pub mod config;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
