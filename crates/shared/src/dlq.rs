//! 死信队列处理
//!
//! 事件处理失败且重试耗尽后，消息被发送到死信队列（DLQ）而非丢弃。
//! 发布类瞬时故障（publish-failure、kafka-error）的死信会按退避计划重新
//! 投递回原 topic——事件尚未进入管线，重投即完成补发。副作用失败则不同：
//! 状态转移此时已经应用、序号已被定序器消费，把事件投回原 topic 只会命中
//! 幂等去重，不会重新分发副作用，因此与状态机拒绝（非法转移、gap-timeout
//! 等确定性失败）一样只记录操作员可见的错误日志等待人工介入。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::OrderError;
use crate::events::OrderEvent;
use crate::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer, topics};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装原始消息，附加失败原因、稳定错误码与重试元数据，
/// DLQ 消费端据此决定重新投递还是归档等待人工处理。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息标识，约定为 "{order_id}:{sequence}"
    pub message_id: String,
    /// 原始 topic
    pub source_topic: String,
    /// 原始消息内容（JSON 字符串）
    pub payload: String,
    /// 失败原因描述
    pub error: String,
    /// 稳定错误码（OrderError::code）
    pub error_code: String,
    /// 已重试次数
    pub retry_count: u32,
    /// 最大重试次数
    pub max_retries: u32,
    /// 首次失败时间
    pub first_failed_at: DateTime<Utc>,
    /// 最近失败时间
    pub last_failed_at: DateTime<Utc>,
    /// 下次重试时间（None 表示不再重试）
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 来源服务
    pub source_service: String,
}

/// 重投只对尚未进入管线的发布类故障有意义。
/// handler-failure 不在其列：副作用失败时事件的序号已被消费，
/// 重投回原 topic 只会被当作重复事件跳过。
fn code_is_redeliverable(code: &str) -> bool {
    matches!(code, "publish-failure" | "kafka-error")
}

impl DeadLetterMessage {
    /// 创建新的死信消息
    ///
    /// 首次进入 DLQ 时 retry_count 为 0；可重投的错误码立即安排首轮重投，
    /// 确定性失败则不安排重投。
    pub fn new(
        message_id: impl Into<String>,
        source_topic: impl Into<String>,
        payload: impl Into<String>,
        error: &OrderError,
        max_retries: u32,
        source_service: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let code = error.code();
        Self {
            message_id: message_id.into(),
            source_topic: source_topic.into(),
            payload: payload.into(),
            error: error.to_string(),
            error_code: code.to_string(),
            retry_count: 0,
            max_retries,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: code_is_redeliverable(code).then_some(now),
            source_service: source_service.into(),
        }
    }

    /// 是否应继续重投
    pub fn should_redeliver(&self) -> bool {
        code_is_redeliverable(&self.error_code) && self.retry_count < self.max_retries
    }

    /// 增加重试计数并更新元数据
    ///
    /// 每次重投失败后调用；根据退避策略计算下一次重投时间，
    /// 达到上限后 next_retry_at 置为 None。
    pub fn increment_retry(&mut self, error: &str, retry_policy: &RetryPolicy) {
        self.retry_count += 1;
        self.error = error.to_string();
        self.last_failed_at = Utc::now();

        if self.should_redeliver() {
            let delay = retry_policy.delay_for_attempt(self.retry_count);
            self.next_retry_at =
                Some(self.last_failed_at + chrono::Duration::from_std(delay).unwrap_or_default());
        } else {
            self.next_retry_at = None;
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer — 将失败消息发送到死信队列
// ---------------------------------------------------------------------------

/// DLQ 生产者
///
/// 处理失败、重试耗尽或被定序器拒绝的事件经由此组件写入死信队列，
/// 保证消息最终被重投或人工处理，绝不静默丢弃。
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    source_service: String,
    max_retries: u32,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, source_service: &str, max_retries: u32) -> Self {
        Self {
            producer,
            source_service: source_service.to_string(),
            max_retries,
        }
    }

    /// 将失败消息发送到死信队列
    pub async fn send_to_dlq(
        &self,
        message_id: &str,
        source_topic: &str,
        payload: &str,
        error: &OrderError,
    ) -> Result<(), OrderError> {
        let dlq_msg = DeadLetterMessage::new(
            message_id,
            source_topic,
            payload,
            error,
            self.max_retries,
            &self.source_service,
        );

        self.producer
            .send_json(topics::DEAD_LETTER_QUEUE, message_id, &dlq_msg)
            .await?;

        warn!(
            message_id,
            source_topic,
            error = %error,
            code = error.code(),
            "消息已发送到死信队列"
        );

        Ok(())
    }

    /// 将订单事件及其失败原因发送到死信队列
    ///
    /// 便捷方法：以 "{order_id}:{sequence}" 作为 message_id，
    /// 整个事件序列化为 payload。
    pub async fn send_event_to_dlq(
        &self,
        event: &OrderEvent,
        error: &OrderError,
    ) -> Result<(), OrderError> {
        let payload = serde_json::to_string(event).map_err(OrderError::Serialization)?;
        let message_id = format!("{}:{}", event.order_id, event.sequence);

        self.send_to_dlq(&message_id, topics::ORDER_EVENTS, &payload, error)
            .await
    }
}

// ---------------------------------------------------------------------------
// DlqConsumer — 处理死信队列消息
// ---------------------------------------------------------------------------

/// DLQ 消费者
///
/// 持续消费死信队列，对尚可重投的消息等到重投时间后发回原始 topic。
/// 确定性失败或重试耗尽的消息记录错误日志以便人工介入。
pub struct DlqConsumer {
    consumer: KafkaConsumer,
    /// 将待重投的消息发回原始 topic
    redeliver_producer: KafkaProducer,
    /// 重投失败后写回 DLQ 时的退避计划
    retry_policy: RetryPolicy,
}

impl DlqConsumer {
    /// 创建 DLQ 消费者
    ///
    /// 使用 `.dlq` 后缀作为独立消费组，与主消费者互不干扰
    pub fn new(config: &AppConfig, redeliver_producer: KafkaProducer) -> Result<Self, OrderError> {
        let consumer = KafkaConsumer::new(&config.kafka, Some("dlq"))?;
        consumer.subscribe(&[topics::DEAD_LETTER_QUEUE])?;

        info!(topic = topics::DEAD_LETTER_QUEUE, "DLQ 消费者已创建");

        Ok(Self {
            consumer,
            redeliver_producer,
            retry_policy: RetryPolicy::from(&config.retry),
        })
    }

    /// 启动 DLQ 消费循环
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let producer = self.redeliver_producer.clone();
        let retry_policy = self.retry_policy.clone();

        self.consumer
            .start(shutdown, move |msg| {
                let producer = producer.clone();
                let retry_policy = retry_policy.clone();
                async move { handle_dlq_message(&msg, &producer, &retry_policy).await }
            })
            .await;

        info!("DLQ 消费循环已退出");
    }
}

/// 处理单条死信消息
///
/// - 可重投 → 等到重投时间后将原始 payload 发回 source_topic；
///   重投本身失败则更新重试元数据写回死信队列，退避后再试
/// - 不可重投（确定性失败或重试耗尽）→ 操作员可见的错误日志，人工介入
async fn handle_dlq_message(
    msg: &ConsumerMessage,
    redeliver_producer: &KafkaProducer,
    retry_policy: &RetryPolicy,
) -> Result<(), OrderError> {
    let dlq_msg: DeadLetterMessage = msg.deserialize_payload()?;

    if !dlq_msg.should_redeliver() {
        error!(
            message_id = %dlq_msg.message_id,
            source_topic = %dlq_msg.source_topic,
            source_service = %dlq_msg.source_service,
            error_code = %dlq_msg.error_code,
            retry_count = dlq_msg.retry_count,
            max_retries = dlq_msg.max_retries,
            first_failed_at = %dlq_msg.first_failed_at,
            last_failed_at = %dlq_msg.last_failed_at,
            error = %dlq_msg.error,
            "死信消息不可重投，需人工介入"
        );
        return Ok(());
    }

    // 消费组开启 auto-commit，跳过等于永久丢失；
    // 重投时间未到的消息原地等到期再发，而非依赖下次消费
    if let Some(wait) = delay_until_due(&dlq_msg, Utc::now()) {
        info!(
            message_id = %dlq_msg.message_id,
            wait_ms = wait.as_millis() as u64,
            "死信消息重投时间未到，等待到期"
        );
        tokio::time::sleep(wait).await;
    }

    info!(
        message_id = %dlq_msg.message_id,
        source_topic = %dlq_msg.source_topic,
        retry_count = dlq_msg.retry_count,
        max_retries = dlq_msg.max_retries,
        "重投死信消息，发回原始 topic"
    );

    // 重投必须沿用原 message_id（即 order_id:seq 对应的 key），
    // 保证与同实体后续事件的相对顺序不被破坏
    let key = dlq_msg
        .message_id
        .split(':')
        .next()
        .unwrap_or(&dlq_msg.message_id)
        .to_string();

    if let Err(e) = redeliver_producer
        .send(&dlq_msg.source_topic, &key, dlq_msg.payload.as_bytes())
        .await
    {
        warn!(
            message_id = %dlq_msg.message_id,
            error = %e,
            "重投失败，更新重试计划后写回死信队列"
        );

        let mut updated = dlq_msg;
        updated.increment_retry(&e.to_string(), retry_policy);
        redeliver_producer
            .send_json(topics::DEAD_LETTER_QUEUE, &updated.message_id, &updated)
            .await?;
    }

    Ok(())
}

/// 距离重投时间还需等待的时长；已到期或未安排重投返回 None
fn delay_until_due(msg: &DeadLetterMessage, now: DateTime<Utc>) -> Option<Duration> {
    let next = msg.next_retry_at?;
    (next > now).then(|| (next - now).to_std().unwrap_or_default())
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
