//! 状态转移引擎
//!
//! 持有每个订单的当前状态，依据生命周期可达性校验并应用状态转移，
//! 成功时产出有序的副作用意图交给分发器。OrderState 只能经由 `apply`
//! 的校验路径变更；状态存储按实体键共享给读侧查询，但每个键只会被
//! 其所属泳道写入。

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use order_shared::error::OrderError;
use order_shared::events::{OrderEvent, OrderStatus};

// ---------------------------------------------------------------------------
// SideEffect — 副作用意图
// ---------------------------------------------------------------------------

/// 副作用能力集合
///
/// 每种意图对应且仅对应一个处理器，由分发器路由。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffectKind {
    InventoryCheck,
    PaymentRequest,
    ShippingRequest,
    NotificationRequest,
    RefundRequest,
}

impl std::fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InventoryCheck => "INVENTORY_CHECK",
            Self::PaymentRequest => "PAYMENT_REQUEST",
            Self::ShippingRequest => "SHIPPING_REQUEST",
            Self::NotificationRequest => "NOTIFICATION_REQUEST",
            Self::RefundRequest => "REFUND_REQUEST",
        };
        write!(f, "{s}")
    }
}

/// 一次已校验转移产出的副作用意图
#[derive(Debug, Clone, Serialize)]
pub struct SideEffect {
    pub kind: SideEffectKind,
    pub order_id: String,
    pub customer_id: String,
    /// 触发该意图的目标状态
    pub triggered_by: OrderStatus,
}

/// 各状态成功落地后需要触发的副作用，顺序即执行顺序
fn effects_for(status: OrderStatus) -> &'static [SideEffectKind] {
    use SideEffectKind::*;
    match status {
        OrderStatus::Created => &[InventoryCheck, PaymentRequest],
        OrderStatus::Paid => &[ShippingRequest],
        OrderStatus::Shipped => &[NotificationRequest],
        OrderStatus::Delivered => &[NotificationRequest],
        OrderStatus::Cancelled => &[RefundRequest, NotificationRequest],
    }
}

// ---------------------------------------------------------------------------
// OrderState — 订单实体状态
// ---------------------------------------------------------------------------

/// 订单实体状态
///
/// 由转移引擎独占写入，记录当前状态、最近一次已应用的序号
/// 以及完整的历史轨迹，实体存活期间一直保留。
#[derive(Debug, Clone, Serialize)]
pub struct OrderState {
    pub order_id: String,
    pub customer_id: String,
    pub current_status: OrderStatus,
    pub last_applied_sequence: u64,
    /// 按应用顺序记录的历史状态（含当前状态）
    pub history: Vec<OrderStatus>,
}

/// 订单状态存储，按实体键共享
pub type StateStore = Arc<DashMap<String, OrderState>>;

// ---------------------------------------------------------------------------
// TransitionEngine
// ---------------------------------------------------------------------------

/// 状态转移引擎
///
/// `apply` 是 OrderState 唯一的变更入口。调用方（定序器）保证同一实体
/// 的事件按序号递增逐个进入，引擎只负责生命周期可达性校验。
pub struct TransitionEngine {
    states: StateStore,
}

impl TransitionEngine {
    pub fn new() -> Self {
        Self {
            states: Arc::new(DashMap::new()),
        }
    }

    /// 使用外部共享的状态存储构建，供多条泳道挂到同一张表上
    pub fn with_store(states: StateStore) -> Self {
        Self { states }
    }

    /// 获取状态存储的共享句柄（读侧查询用）
    pub fn store(&self) -> StateStore {
        self.states.clone()
    }

    /// 查询某订单的当前状态快照
    pub fn state_of(&self, order_id: &str) -> Option<OrderState> {
        self.states.get(order_id).map(|s| s.clone())
    }

    /// 校验并应用一次状态转移，成功时返回有序的副作用意图
    ///
    /// - 未知实体收到 CREATED → 创建新 OrderState
    /// - 未知实体收到其他状态 → `unknown-entity`
    /// - 已知实体但目标状态不可达 → `invalid-transition`
    pub fn apply(&self, event: &OrderEvent) -> Result<Vec<SideEffect>, OrderError> {
        match self.states.get_mut(&event.order_id) {
            Some(mut state) => {
                if !state.current_status.can_transition_to(event.status) {
                    return Err(OrderError::InvalidTransition {
                        order_id: event.order_id.clone(),
                        from: state.current_status,
                        to: event.status,
                    });
                }

                state.current_status = event.status;
                state.last_applied_sequence = event.sequence;
                state.history.push(event.status);

                info!(
                    order_id = %event.order_id,
                    status = %event.status,
                    sequence = event.sequence,
                    "状态转移已应用"
                );
            }
            None => {
                if event.status != OrderStatus::Created {
                    return Err(OrderError::UnknownEntity {
                        order_id: event.order_id.clone(),
                        status: event.status,
                    });
                }

                self.states.insert(
                    event.order_id.clone(),
                    OrderState {
                        order_id: event.order_id.clone(),
                        customer_id: event.customer_id.clone(),
                        current_status: OrderStatus::Created,
                        last_applied_sequence: event.sequence,
                        history: vec![OrderStatus::Created],
                    },
                );

                info!(
                    order_id = %event.order_id,
                    customer_id = %event.customer_id,
                    sequence = event.sequence,
                    "新订单实体已创建"
                );
            }
        }

        let effects: Vec<SideEffect> = effects_for(event.status)
            .iter()
            .map(|&kind| SideEffect {
                kind,
                order_id: event.order_id.clone(),
                customer_id: event.customer_id.clone(),
                triggered_by: event.status,
            })
            .collect();

        debug!(
            order_id = %event.order_id,
            status = %event.status,
            effects = effects.len(),
            "副作用意图已生成"
        );

        Ok(effects)
    }
}

impl Default for TransitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
