//! 订单事件处理服务
//!
//! 消费 Kafka 中的订单生命周期事件，在 broker 背后实现真正的处理核心：
//! 按实体定序（乱序恢复 + 幂等去重）、状态机校验、副作用分发与重试。
//! 同一 order_id 的事件经泳道哈希路由串行处理，不同订单之间完全并行。

pub mod consumer;
pub mod dispatch;
pub mod engine;
pub mod handlers;
pub mod lane;
pub mod publisher;
pub mod sequencer;
