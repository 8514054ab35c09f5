//! 按实体定序器
//!
//! 保证每个 order_id 的事件按序号递增、恰好一次效果地进入转移引擎，
//! 即使 broker 投递乱序或重复。维护每实体的下一期望序号与有界的提前
//! 到达缓冲区：
//! - 序号命中期望值 → 立即应用，并连带排空缓冲区中已接续上的事件
//! - 序号超前 → 缓冲；缓冲区满则拒绝（buffer-exhausted）并冻结实体
//! - 序号落后 → 重复事件，幂等空操作，不重新触发副作用
//!
//! 缓冲条目等待补洞超过配置时限后由 `expire_stale` 驱逐并上报
//! （gap-timeout），绝不静默丢弃。

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use order_shared::config::SequencerConfig;
use order_shared::error::OrderError;
use order_shared::events::OrderEvent;

use crate::engine::{SideEffect, TransitionEngine};

// ---------------------------------------------------------------------------
// Admission — 准入结果
// ---------------------------------------------------------------------------

/// 单个事件经引擎处理后的结果
///
/// 补洞可能连带排空多个缓冲事件，每个事件的应用结果独立记录：
/// 引擎拒绝（非法转移等）不阻断后续事件的排空，由调用方逐条上报。
#[derive(Debug)]
pub struct EventOutcome {
    pub event: OrderEvent,
    pub result: Result<Vec<SideEffect>, OrderError>,
}

/// `admit` 的准入结果
#[derive(Debug)]
pub enum Admission {
    /// 事件已被消费。`outcomes` 为本事件及连带排空事件的逐条结果；
    /// 重复事件返回空列表（幂等空操作）。
    Applied { outcomes: Vec<EventOutcome> },
    /// 事件提前到达，已缓冲等待补洞
    Buffered,
    /// 定序器层面拒绝（缓冲区满），实体已冻结，上游需背压或人工介入。
    /// 事件随结果返还，便于调用方写入死信队列。
    Rejected {
        event: OrderEvent,
        error: OrderError,
    },
}

/// 因补洞超时被驱逐的缓冲条目
#[derive(Debug)]
pub struct ExpiredEntry {
    pub event: OrderEvent,
    pub error: OrderError,
}

// ---------------------------------------------------------------------------
// EntityProgress — 每实体的定序状态
// ---------------------------------------------------------------------------

/// 单个实体的定序进度，只会被其所属泳道访问
struct EntityProgress {
    /// 下一个期望的序号，从 1 开始
    expected: u64,
    /// 提前到达的事件，按序号排序等待补洞
    pending: BTreeMap<u64, PendingEvent>,
    /// 缓冲区曾溢出且尚未排空，冻结期间只接受补洞事件与重复事件
    frozen: bool,
}

struct PendingEvent {
    event: OrderEvent,
    buffered_at: Instant,
}

impl EntityProgress {
    fn new() -> Self {
        Self {
            expected: 1,
            pending: BTreeMap::new(),
            frozen: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

/// 按实体定序器
///
/// 每条泳道独占一个 Sequencer 实例，内部状态无需跨泳道加锁。
/// 引擎通过共享 StateStore 挂载，使不同泳道的实体状态汇入同一张表。
pub struct Sequencer {
    engine: TransitionEngine,
    progress: HashMap<String, EntityProgress>,
    buffer_capacity: usize,
    gap_timeout: Duration,
}

impl Sequencer {
    pub fn new(engine: TransitionEngine, config: &SequencerConfig) -> Self {
        Self {
            engine,
            progress: HashMap::new(),
            buffer_capacity: config.buffer_capacity,
            gap_timeout: config.gap_timeout(),
        }
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    /// 准入一个事件
    ///
    /// `now` 由调用方传入而非内部取时钟，便于测试控制超时行为。
    pub fn admit(&mut self, event: OrderEvent, now: Instant) -> Admission {
        let progress = self
            .progress
            .entry(event.order_id.clone())
            .or_insert_with(EntityProgress::new);

        // 落后于已消费进度：重复投递，幂等空操作
        if event.sequence < progress.expected {
            debug!(
                order_id = %event.order_id,
                sequence = event.sequence,
                expected = progress.expected,
                "重复事件，跳过"
            );
            return Admission::Applied { outcomes: vec![] };
        }

        // 提前到达
        if event.sequence > progress.expected {
            if progress.pending.contains_key(&event.sequence) {
                // 同序号已在缓冲中，重复缓冲也是幂等空操作
                debug!(
                    order_id = %event.order_id,
                    sequence = event.sequence,
                    "事件已在缓冲区，跳过"
                );
                return Admission::Buffered;
            }

            if progress.frozen || progress.pending.len() >= self.buffer_capacity {
                progress.frozen = true;
                warn!(
                    order_id = %event.order_id,
                    sequence = event.sequence,
                    capacity = self.buffer_capacity,
                    "乱序缓冲区已满，实体冻结"
                );
                let error = OrderError::BufferExhausted {
                    order_id: event.order_id.clone(),
                    capacity: self.buffer_capacity,
                };
                return Admission::Rejected { event, error };
            }

            debug!(
                order_id = %event.order_id,
                sequence = event.sequence,
                expected = progress.expected,
                buffered = progress.pending.len() + 1,
                "事件提前到达，已缓冲"
            );
            progress.pending.insert(
                event.sequence,
                PendingEvent {
                    event,
                    buffered_at: now,
                },
            );
            return Admission::Buffered;
        }

        // 命中期望序号：应用本事件并排空已接续上的缓冲事件。
        // 引擎拒绝的事件同样消耗其序号，否则一条永久非法的事件
        // 会把同实体的整条流卡死。
        let mut outcomes = Vec::new();

        let result = self.engine.apply(&event);
        progress.expected += 1;
        outcomes.push(EventOutcome { event, result });

        while let Some(entry) = progress.pending.remove(&progress.expected) {
            let result = self.engine.apply(&entry.event);
            progress.expected += 1;
            outcomes.push(EventOutcome {
                event: entry.event,
                result,
            });
        }

        // 缓冲区降到容量以下后解除冻结
        if progress.frozen && progress.pending.len() < self.buffer_capacity {
            progress.frozen = false;
            debug!("缓冲区已排空，实体解除冻结");
        }

        Admission::Applied { outcomes }
    }

    /// 驱逐等待补洞超时的缓冲条目
    ///
    /// 由泳道按固定间隔调用；被驱逐的事件以 gap-timeout 上报给调用方，
    /// 由其写入死信队列并记录操作员可见的日志。
    pub fn expire_stale(&mut self, now: Instant) -> Vec<ExpiredEntry> {
        let mut expired = Vec::new();

        for progress in self.progress.values_mut() {
            let stale: Vec<u64> = progress
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.buffered_at) >= self.gap_timeout)
                .map(|(&seq, _)| seq)
                .collect();

            for seq in stale {
                if let Some(entry) = progress.pending.remove(&seq) {
                    let waited_ms = now.duration_since(entry.buffered_at).as_millis() as u64;
                    warn!(
                        order_id = %entry.event.order_id,
                        sequence = seq,
                        waited_ms,
                        "缓冲事件等待补洞超时，已驱逐"
                    );
                    expired.push(ExpiredEntry {
                        error: OrderError::GapTimeout {
                            order_id: entry.event.order_id.clone(),
                            sequence: seq,
                            waited_ms,
                        },
                        event: entry.event,
                    });
                }
            }

            if progress.frozen && progress.pending.len() < self.buffer_capacity {
                progress.frozen = false;
            }
        }

        expired
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SideEffectKind;
    use order_shared::events::OrderStatus;

    fn sequencer_with_capacity(capacity: usize) -> Sequencer {
        Sequencer::new(
            TransitionEngine::new(),
            &SequencerConfig {
                buffer_capacity: capacity,
                gap_timeout_ms: 30_000,
            },
        )
    }

    fn applied_events(admission: &Admission) -> Vec<(u64, bool)> {
        match admission {
            Admission::Applied { outcomes } => outcomes
                .iter()
                .map(|o| (o.event.sequence, o.result.is_ok()))
                .collect(),
            other => panic!("期望 Applied，实际 {other:?}"),
        }
    }

    #[test]
    fn test_in_order_events_applied_immediately() {
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        let admission = seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        assert_eq!(applied_events(&admission), vec![(1, true)]);

        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        assert_eq!(applied_events(&admission), vec![(2, true)]);

        let state = seq.engine().state_of("ord-1").unwrap();
        assert_eq!(state.current_status, OrderStatus::Paid);
        assert_eq!(state.last_applied_sequence, 2);
    }

    #[test]
    fn test_out_of_order_events_buffered_then_drained() {
        // 规格示例：[CREATED(1), PAID(2), SHIPPED(3)] 按 [1, 3, 2] 到达
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        let admission = seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        assert_eq!(applied_events(&admission), vec![(1, true)]);

        // seq=3 先到，缓冲
        let admission = seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), now);
        assert!(matches!(admission, Admission::Buffered));

        // seq=2 补洞，连带排空 seq=3
        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        assert_eq!(applied_events(&admission), vec![(2, true), (3, true)]);

        let state = seq.engine().state_of("ord-1").unwrap();
        assert_eq!(state.current_status, OrderStatus::Shipped);
        assert_eq!(state.last_applied_sequence, 3);
        assert_eq!(
            state.history,
            vec![OrderStatus::Created, OrderStatus::Paid, OrderStatus::Shipped]
        );
    }

    #[test]
    fn test_duplicate_event_is_idempotent_noop() {
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);

        // 重复投递 seq=1：Applied 但无任何新效果
        let admission = seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        assert!(applied_events(&admission).is_empty());

        // 重复投递 seq=2 同样为空操作
        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        assert!(applied_events(&admission).is_empty());

        // 状态未被改写
        let state = seq.engine().state_of("ord-1").unwrap();
        assert_eq!(state.current_status, OrderStatus::Paid);
        assert_eq!(state.last_applied_sequence, 2);
        assert_eq!(state.history, vec![OrderStatus::Created, OrderStatus::Paid]);
    }

    #[test]
    fn test_duplicate_of_buffered_event_not_double_counted() {
        let mut seq = sequencer_with_capacity(2);
        let now = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);

        assert!(matches!(
            seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), now),
            Admission::Buffered
        ));
        // 同序号重复缓冲不占用额外容量
        assert!(matches!(
            seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), now),
            Admission::Buffered
        ));
        assert!(matches!(
            seq.admit(OrderEvent::delivered("ord-1", "cust-1", 4), now),
            Admission::Buffered
        ));

        // 容量 2 已满，第三个不同序号被拒绝
        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 5), now);
        assert!(matches!(admission, Admission::Rejected { .. }));
    }

    #[test]
    fn test_buffer_exhausted_freezes_entity_until_drained() {
        let mut seq = sequencer_with_capacity(2);
        let now = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);

        // 填满缓冲区：seq 3、4
        seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), now);
        seq.admit(OrderEvent::delivered("ord-1", "cust-1", 4), now);

        // 溢出 → 拒绝并冻结
        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 5), now);
        match admission {
            Admission::Rejected { error, .. } => assert_eq!(error.code(), "buffer-exhausted"),
            other => panic!("期望 Rejected，实际 {other:?}"),
        }

        // 冻结期间即使缓冲区有空位的序号也被拒绝
        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 6), now);
        assert!(matches!(admission, Admission::Rejected { .. }));

        // 补洞事件（seq=2）仍被接受，连带排空 3、4 并解除冻结
        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        assert_eq!(
            applied_events(&admission),
            vec![(2, true), (3, true), (4, true)]
        );

        // 解除冻结后恢复接收提前事件
        let admission = seq.admit(OrderEvent::cancelled("ord-1", "cust-1", 6, "x"), now);
        assert!(matches!(admission, Admission::Buffered));
    }

    #[test]
    fn test_rejected_in_order_event_consumes_sequence() {
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), now);

        // SHIPPED 后取消是非法转移，但序号 4 被消耗
        let admission = seq.admit(OrderEvent::cancelled("ord-1", "cust-1", 4, "太晚"), now);
        assert_eq!(applied_events(&admission), vec![(4, false)]);

        // 流未被卡死，seq=5 正常应用
        let admission = seq.admit(OrderEvent::delivered("ord-1", "cust-1", 5), now);
        assert_eq!(applied_events(&admission), vec![(5, true)]);

        // last_applied_sequence 只反映成功应用的事件
        let state = seq.engine().state_of("ord-1").unwrap();
        assert_eq!(state.current_status, OrderStatus::Delivered);
        assert_eq!(state.last_applied_sequence, 5);
    }

    #[test]
    fn test_drain_continues_past_engine_rejection() {
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), now);

        // seq 5（SHIPPED 后取消，非法）先缓冲，seq 4（DELIVERED，合法）补洞
        seq.admit(OrderEvent::cancelled("ord-1", "cust-1", 5, "x"), now);
        let admission = seq.admit(OrderEvent::delivered("ord-1", "cust-1", 4), now);

        // 4 合法应用；5 被引擎拒绝但不阻断排空
        let results = applied_events(&admission);
        assert_eq!(results, vec![(4, true), (5, false)]);
    }

    #[test]
    fn test_gap_timeout_evicts_and_reports() {
        let mut seq = Sequencer::new(
            TransitionEngine::new(),
            &SequencerConfig {
                buffer_capacity: 16,
                gap_timeout_ms: 1_000,
            },
        );
        let start = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), start);
        seq.admit(OrderEvent::shipped("ord-1", "cust-1", 3), start);

        // 未到超时不驱逐
        let expired = seq.expire_stale(start + Duration::from_millis(500));
        assert!(expired.is_empty());

        // 超时后驱逐并携带 gap-timeout 错误
        let expired = seq.expire_stale(start + Duration::from_millis(1_500));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].event.sequence, 3);
        assert_eq!(expired[0].error.code(), "gap-timeout");

        // 驱逐后缓冲区为空，补洞事件照常前进
        let admission = seq.admit(
            OrderEvent::paid("ord-1", "cust-1", 2),
            start + Duration::from_secs(2),
        );
        assert_eq!(applied_events(&admission), vec![(2, true)]);
    }

    #[test]
    fn test_entities_are_sequenced_independently() {
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        seq.admit(OrderEvent::created_with_id("ord-a", "cust-1"), now);
        seq.admit(OrderEvent::created_with_id("ord-b", "cust-2"), now);

        // ord-a 的超前事件不影响 ord-b 的进度
        assert!(matches!(
            seq.admit(OrderEvent::shipped("ord-a", "cust-1", 3), now),
            Admission::Buffered
        ));
        let admission = seq.admit(OrderEvent::paid("ord-b", "cust-2", 2), now);
        assert_eq!(applied_events(&admission), vec![(2, true)]);
    }

    #[test]
    fn test_first_event_out_of_order_is_buffered() {
        // 实体的首个事件也可能乱序到达（seq=2 先于 seq=1）
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        let admission = seq.admit(OrderEvent::paid("ord-1", "cust-1", 2), now);
        assert!(matches!(admission, Admission::Buffered));

        let admission = seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        assert_eq!(applied_events(&admission), vec![(1, true), (2, true)]);

        let state = seq.engine().state_of("ord-1").unwrap();
        assert_eq!(state.current_status, OrderStatus::Paid);
    }

    #[test]
    fn test_applied_effects_not_reinvoked_on_duplicate() {
        let mut seq = sequencer_with_capacity(16);
        let now = Instant::now();

        let admission = seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        let effects: Vec<SideEffectKind> = match &admission {
            Admission::Applied { outcomes } => outcomes[0]
                .result
                .as_ref()
                .unwrap()
                .iter()
                .map(|e| e.kind)
                .collect(),
            other => panic!("期望 Applied，实际 {other:?}"),
        };
        assert_eq!(
            effects,
            vec![
                SideEffectKind::InventoryCheck,
                SideEffectKind::PaymentRequest
            ]
        );

        // 重复事件不产出任何副作用意图
        let admission = seq.admit(OrderEvent::created_with_id("ord-1", "cust-1"), now);
        match admission {
            Admission::Applied { outcomes } => assert!(outcomes.is_empty()),
            other => panic!("期望 Applied，实际 {other:?}"),
        }
    }
}
