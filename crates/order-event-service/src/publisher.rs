//! 订单事件发布器
//!
//! 对外暴露核心的唯一入口：HTTP 前门等协作方只通过 `publish` 写入事件。
//! 分区键恒为 order_id，保证同一订单的事件在线上全序；投递失败按退避
//! 重试且始终沿用同一 key，绝不换键重排。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use order_shared::error::OrderError;
use order_shared::events::OrderEvent;
use order_shared::kafka::{Delivery, KafkaProducer, topics};
use order_shared::retry::{RetryPolicy, retry_with_policy};

// ---------------------------------------------------------------------------
// EventTransport — broker 发送能力抽象
// ---------------------------------------------------------------------------

/// broker 发送能力
///
/// 以 trait object 注入而非直接依赖 KafkaProducer，
/// 便于在测试中替换为可控的失败序列。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send_event(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, OrderError>;
}

#[async_trait]
impl EventTransport for KafkaProducer {
    async fn send_event(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, OrderError> {
        self.send(topic, key, payload).await
    }
}

// ---------------------------------------------------------------------------
// OrderPublisher
// ---------------------------------------------------------------------------

/// 订单事件发布器
pub struct OrderPublisher {
    transport: Arc<dyn EventTransport>,
    retry: RetryPolicy,
}

impl OrderPublisher {
    pub fn new(transport: Arc<dyn EventTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// 发布订单事件，等待 broker 确认后返回投递位置
    ///
    /// 以 order_id 为消息 key；瞬时投递失败在内部按退避重试，
    /// 耗尽后以 publish-failure 上抛，由调用方决定丢弃或转入操作员渠道。
    pub async fn publish(&self, event: &OrderEvent) -> Result<Delivery, OrderError> {
        info!(
            order_id = %event.order_id,
            status = %event.status,
            sequence = event.sequence,
            "发布订单事件"
        );

        let payload = serde_json::to_vec(event).map_err(OrderError::Serialization)?;

        let result = retry_with_policy(
            &self.retry,
            "publish_order_event",
            |e| e.is_retryable(),
            || async {
                self.transport
                    .send_event(topics::ORDER_EVENTS, &event.order_id, &payload)
                    .await
                    .map_err(|e| OrderError::Publish {
                        order_id: event.order_id.clone(),
                        message: e.to_string(),
                    })
            },
        )
        .await;

        match &result {
            Ok(delivery) => {
                info!(
                    order_id = %event.order_id,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "发布成功"
                );
            }
            Err(e) => {
                error!(
                    order_id = %event.order_id,
                    sequence = event.sequence,
                    error = %e,
                    "发布失败，重试已耗尽"
                );
            }
        }

        result
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
