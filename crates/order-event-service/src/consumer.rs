//! 订单事件消费者
//!
//! 订阅 order.events topic，将 Kafka 消息解码为订单事件信封并提交到
//! 泳道池。解码失败的毒消息写入死信队列而非丢弃；泳道队满时 `submit`
//! 等待，背压自然传导回消费端。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use order_shared::config::AppConfig;
use order_shared::dlq::DlqProducer;
use order_shared::error::OrderError;
use order_shared::events::OrderEvent;
use order_shared::kafka::{ConsumerMessage, KafkaConsumer, topics};

use crate::lane::LanePool;

/// 订单事件消费者
///
/// 组合 KafkaConsumer（消息拉取）、LanePool（定序与分发）
/// 和 DlqProducer（毒消息上报）形成完整的消费管道。
pub struct OrderConsumer {
    consumer: KafkaConsumer,
    dlq: DlqProducer,
}

impl OrderConsumer {
    pub fn new(config: &AppConfig, dlq: DlqProducer) -> Result<Self, OrderError> {
        let consumer = KafkaConsumer::new(&config.kafka, None)?;
        Ok(Self { consumer, dlq })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>, lanes: Arc<LanePool>) {
        if let Err(e) = self.consumer.subscribe(&[topics::ORDER_EVENTS]) {
            warn!(error = %e, "订阅订单事件 topic 失败，消费者退出");
            return;
        }

        info!(topic = topics::ORDER_EVENTS, "订单事件消费者已启动");

        let dlq = self.dlq;

        self.consumer
            .start(shutdown, move |msg| {
                let lanes = lanes.clone();
                let dlq = dlq.clone();
                async move { ingest_message(&lanes, &dlq, &msg).await }
            })
            .await;

        info!("订单事件消费者已停止");
    }
}

/// 处理单条 Kafka 消息：解码 → 接收日志 → 提交泳道
///
/// 独立函数便于在测试中直接调用而无需构造完整的消费者。
pub async fn ingest_message(
    lanes: &LanePool,
    dlq: &DlqProducer,
    msg: &ConsumerMessage,
) -> Result<(), OrderError> {
    let event: OrderEvent = match msg.deserialize_payload() {
        Ok(event) => event,
        Err(e) => {
            warn!(
                partition = msg.partition,
                offset = msg.offset,
                key = msg.key.as_deref().unwrap_or("-"),
                error = %e,
                "订单事件解码失败，原始消息转入死信队列"
            );
            let message_id = msg
                .key
                .clone()
                .unwrap_or_else(|| format!("{}:{}", msg.partition, msg.offset));
            let payload = String::from_utf8_lossy(&msg.payload).into_owned();
            dlq.send_to_dlq(&message_id, &msg.topic, &payload, &e).await?;
            return Err(e);
        }
    };

    info!(
        partition = msg.partition,
        offset = msg.offset,
        key = msg.key.as_deref().unwrap_or("-"),
        order_id = %event.order_id,
        customer_id = %event.customer_id,
        status = %event.status,
        sequence = event.sequence,
        description = %event.description,
        "收到订单事件"
    );

    lanes.submit(event).await
}
