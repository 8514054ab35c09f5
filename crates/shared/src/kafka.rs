//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为面向订单管线的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射与优雅关闭语义。核心只通过这里的接口接触 broker。

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::OrderError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理 topic 名称，避免字符串散落在各模块导致拼写不一致
pub mod topics {
    pub const ORDER_EVENTS: &str = "order.events";
    pub const DEAD_LETTER_QUEUE: &str = "order.dlq";
}

// ---------------------------------------------------------------------------
// Delivery — 投递回执
// ---------------------------------------------------------------------------

/// broker 确认后的投递位置
///
/// 同一 order_id 的事件共享分区，offset 单调递增即可证明在线顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点交给泳道处理。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            timestamp: msg.timestamp().to_millis(),
        }
    }

    /// 将 JSON 负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, OrderError> {
        serde_json::from_slice(&self.payload).map_err(OrderError::Serialization)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 提供类型安全的 JSON 发送方法。
/// `FutureProducer` 内部是 Arc 包装，Clone 开销极小。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 设为 5 秒：5 秒内无法投递应交给上层重试或死信，
    /// 而非无限等待。
    pub fn new(config: &KafkaConfig) -> Result<Self, OrderError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| OrderError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，返回 broker 确认的投递位置
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<Delivery, OrderError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| OrderError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok(Delivery {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<Delivery, OrderError> {
        let payload = serde_json::to_vec(value).map_err(OrderError::Serialization)?;
        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义，
/// 保证进程退出时不丢失正在处理的消息。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立消费组，
    /// 例如主消费组 "order-processor" 与死信消费组 "order-processor.dlq"。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, OrderError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| OrderError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), OrderError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| OrderError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// `tokio::select!` 同时监听消息流和关闭信号：
    /// - handler 返回错误只记录日志不中断循环，单条坏消息不应拖垮整个消费者；
    /// - 关闭信号到达后退出循环，正在执行的 handler 自然完成。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), OrderError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                "收到 Kafka 消息"
                            );

                            if let Err(e) = handler(msg).await {
                                error!(error = %e, code = e.code(), "处理 Kafka 消息失败");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OrderEvent, OrderStatus};

    #[test]
    fn test_topic_constants() {
        assert_eq!(topics::ORDER_EVENTS, "order.events");
        assert_eq!(topics::DEAD_LETTER_QUEUE, "order.dlq");
    }

    #[test]
    fn test_consumer_message_deserialize_order_event() {
        let event = OrderEvent::created_with_id("ord-1", "cust-1");
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 2,
            offset: 17,
            key: Some("ord-1".to_string()),
            payload: serde_json::to_vec(&event).unwrap(),
            timestamp: Some(1_700_000_000_000),
        };

        let back: OrderEvent = msg.deserialize_payload().unwrap();
        assert_eq!(back.order_id, "ord-1");
        assert_eq!(back.status, OrderStatus::Created);
        assert_eq!(back.sequence, 1);
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = ConsumerMessage {
            topic: "order.events".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: b"not json".to_vec(),
            timestamp: None,
        };

        let result: Result<serde_json::Value, _> = msg.deserialize_payload();
        assert!(result.is_err());
    }

    #[test]
    fn test_delivery_equality() {
        let a = Delivery {
            partition: 1,
            offset: 42,
        };
        let b = Delivery {
            partition: 1,
            offset: 42,
        };
        assert_eq!(a, b);
    }
}
