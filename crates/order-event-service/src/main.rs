//! 订单事件处理服务入口
//!
//! 装配顺序：配置 → 日志 → Kafka 生产者/DLQ → 分发器 → 泳道池 →
//! 消费者 + DLQ 消费者。收到 Ctrl-C 后通过 watch channel 广播关闭信号，
//! 等消费者停止、泳道排空后再退出。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

use order_shared::config::AppConfig;
use order_shared::dlq::{DlqConsumer, DlqProducer};
use order_shared::kafka::KafkaProducer;
use order_shared::observability;

use order_event_service::consumer::OrderConsumer;
use order_event_service::engine::StateStore;
use order_event_service::handlers;
use order_event_service::lane::LanePool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("order-event-service")?;
    observability::init(&config.observability)?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        lanes = config.lanes.count,
        "订单事件处理服务启动中"
    );

    let producer = KafkaProducer::new(&config.kafka)?;
    let dlq = DlqProducer::new(
        producer.clone(),
        &config.service_name,
        config.retry.max_retries,
    );

    let store: StateStore = Arc::new(DashMap::new());
    let dispatcher = Arc::new(handlers::default_dispatcher());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lanes = Arc::new(LanePool::spawn(
        &config,
        store.clone(),
        dispatcher,
        dlq.clone(),
        shutdown_rx.clone(),
    ));

    let consumer = OrderConsumer::new(&config, dlq.clone())?;
    let consumer_task = tokio::spawn(consumer.run(shutdown_rx.clone(), lanes.clone()));

    let dlq_consumer = DlqConsumer::new(&config, producer.clone())?;
    let dlq_task = tokio::spawn(dlq_consumer.run(shutdown_rx.clone()));

    info!("服务已就绪，等待事件");

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始优雅关闭");

    // 广播关闭：消费者先停止拉取，泳道随后排空队列
    shutdown_tx.send(true)?;

    consumer_task.await?;
    dlq_task.await?;
    lanes.join().await;

    info!("订单事件处理服务已退出");
    Ok(())
}
