//! 工作泳道池
//!
//! 并发模型：N 条泳道（tokio 任务），order_id 哈希稳定映射到泳道，
//! 同一实体的事件串行处理保证实体内顺序，不同实体之间完全并行。
//! 每条泳道独占其实体集合的定序状态，无需跨泳道加锁。
//!
//! 泳道串行执行：准入 → 副作用分发（带退避重试）→ 拒绝/超时上报 DLQ，
//! 并按固定间隔运行补洞超时扫描。收到关闭信号后先排空队列中的事件
//! 再退出，确保不丢失已接收的工作。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use order_shared::config::AppConfig;
use order_shared::dlq::DlqProducer;
use order_shared::error::OrderError;
use order_shared::events::OrderEvent;
use order_shared::retry::{RetryPolicy, retry_with_policy};

use crate::dispatch::Dispatcher;
use crate::engine::{StateStore, TransitionEngine};
use crate::sequencer::{Admission, Sequencer};

// ---------------------------------------------------------------------------
// LanePool
// ---------------------------------------------------------------------------

/// 泳道池
///
/// 持有各泳道的入队端与任务句柄。入队通道有界，队满时 `submit`
/// 等待形成背压，自然传导到 Kafka 消费端。
pub struct LanePool {
    senders: Vec<mpsc::Sender<OrderEvent>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LanePool {
    /// 启动泳道池
    ///
    /// 每条泳道挂载共享 StateStore 的独立引擎与定序器实例，
    /// 使所有泳道的实体状态汇入同一张可查询的表。
    pub fn spawn(
        config: &AppConfig,
        store: StateStore,
        dispatcher: Arc<Dispatcher>,
        dlq: DlqProducer,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let lane_count = config.lanes.count.max(1);
        let retry = RetryPolicy::from(&config.retry);
        let sweep_interval = Duration::from_millis(config.lanes.sweep_interval_ms);

        let mut senders = Vec::with_capacity(lane_count);
        let mut handles = Vec::with_capacity(lane_count);

        for lane_id in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.lanes.queue_depth);
            let sequencer = Sequencer::new(
                TransitionEngine::with_store(store.clone()),
                &config.sequencer,
            );

            let handle = tokio::spawn(lane_worker(
                lane_id,
                rx,
                shutdown.clone(),
                sequencer,
                dispatcher.clone(),
                dlq.clone(),
                retry.clone(),
                sweep_interval,
            ));

            senders.push(tx);
            handles.push(handle);
        }

        info!(lanes = lane_count, "泳道池已启动");

        Self {
            senders,
            handles: Mutex::new(handles),
        }
    }

    /// order_id 到泳道的稳定映射
    fn lane_for(&self, order_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        order_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// 将事件提交到其所属泳道，队满时等待（背压）
    pub async fn submit(&self, event: OrderEvent) -> Result<(), OrderError> {
        let lane = self.lane_for(&event.order_id);
        self.senders[lane]
            .send(event)
            .await
            .map_err(|e| OrderError::Internal(format!("泳道 {lane} 已关闭: {e}")))
    }

    /// 等待所有泳道排空并退出
    ///
    /// 需先通过 watch channel 发出关闭信号，否则会一直等待。
    pub async fn join(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "泳道任务异常退出");
            }
        }

        info!("所有泳道已退出");
    }
}

// ---------------------------------------------------------------------------
// 泳道工作循环
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn lane_worker(
    lane_id: usize,
    mut rx: mpsc::Receiver<OrderEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut sequencer: Sequencer,
    dispatcher: Arc<Dispatcher>,
    dlq: DlqProducer,
    retry: RetryPolicy,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);

    info!(lane_id, "泳道已启动");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(lane_id, "泳道收到关闭信号");
                    break;
                }
            }

            _ = sweep.tick() => {
                report_expired(lane_id, &mut sequencer, &dlq).await;
            }

            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };
                process_event(lane_id, &mut sequencer, &dispatcher, &dlq, &retry, event).await;
            }
        }
    }

    // 关闭后排空队列中剩余事件再退出，不丢失已接收的工作
    rx.close();
    let mut drained = 0usize;
    while let Some(event) = rx.recv().await {
        process_event(lane_id, &mut sequencer, &dispatcher, &dlq, &retry, event).await;
        drained += 1;
    }

    if drained > 0 {
        info!(lane_id, drained, "泳道排空完成");
    }
    info!(lane_id, "泳道已退出");
}

/// 处理单个事件：准入 → 分发 → 上报
async fn process_event(
    lane_id: usize,
    sequencer: &mut Sequencer,
    dispatcher: &Dispatcher,
    dlq: &DlqProducer,
    retry: &RetryPolicy,
    event: OrderEvent,
) {
    match sequencer.admit(event, Instant::now()) {
        Admission::Applied { outcomes } => {
            for outcome in outcomes {
                match outcome.result {
                    Ok(effects) => {
                        for effect in &effects {
                            let dispatched = retry_with_policy(
                                retry,
                                "dispatch_side_effect",
                                |e| e.is_retryable(),
                                || async { dispatcher.dispatch(effect).await },
                            )
                            .await;

                            if let Err(e) = dispatched {
                                error!(
                                    lane_id,
                                    order_id = %outcome.event.order_id,
                                    kind = %effect.kind,
                                    error = %e,
                                    "副作用重试耗尽，事件转入死信队列"
                                );
                                report_to_dlq(dlq, &outcome.event, &e).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            lane_id,
                            order_id = %outcome.event.order_id,
                            sequence = outcome.event.sequence,
                            code = e.code(),
                            error = %e,
                            "事件被转移引擎拒绝，转入死信队列"
                        );
                        report_to_dlq(dlq, &outcome.event, &e).await;
                    }
                }
            }
        }
        Admission::Buffered => {
            debug!(lane_id, "事件已缓冲等待补洞");
        }
        Admission::Rejected { event, error } => {
            error!(
                lane_id,
                order_id = %event.order_id,
                sequence = event.sequence,
                code = error.code(),
                error = %error,
                "定序器拒绝事件，实体已冻结"
            );
            report_to_dlq(dlq, &event, &error).await;
        }
    }
}

/// 补洞超时扫描：驱逐的事件全部上报死信队列
async fn report_expired(lane_id: usize, sequencer: &mut Sequencer, dlq: &DlqProducer) {
    for expired in sequencer.expire_stale(Instant::now()) {
        warn!(
            lane_id,
            order_id = %expired.event.order_id,
            sequence = expired.event.sequence,
            "补洞超时，事件转入死信队列"
        );
        report_to_dlq(dlq, &expired.event, &expired.error).await;
    }
}

async fn report_to_dlq(dlq: &DlqProducer, event: &OrderEvent, error: &OrderError) {
    if let Err(dlq_err) = dlq.send_event_to_dlq(event, error).await {
        // DLQ 本身不可用时只剩日志这一条兜底通道
        error!(
            order_id = %event.order_id,
            sequence = event.sequence,
            error = %dlq_err,
            "写入死信队列失败，消息可能丢失"
        );
    }
}

// ---------------------------------------------------------------------------
// 集成测试（进程内）
// ---------------------------------------------------------------------------
