//! 订单事件模型
//!
//! 定义订单生命周期事件的统一信封格式与状态枚举。事件一经构造即不可变，
//! 由发布端创建、定序器消费一次后丢弃。信封采用 camelCase JSON 序列化并
//! 携带 `schemaVersion` 字段；反序列化容忍未知字段，保证向前兼容。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 当前事件信封的 schema 版本
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// OrderStatus — 订单状态枚举
// ---------------------------------------------------------------------------

/// 订单生命周期状态
///
/// 状态沿 CREATED -> PAID -> SHIPPED -> DELIVERED 全序推进，
/// CANCELLED 仅可从 CREATED 或 PAID 到达。可达性判定见 `can_transition_to`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// 判断能否从当前状态转移到目标状态
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Paid)
                | (Self::Created, Self::Cancelled)
                | (Self::Paid, Self::Shipped)
                | (Self::Paid, Self::Cancelled)
                | (Self::Shipped, Self::Delivered)
        )
    }

    /// 终态不再接受任何转移
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 与 serde 的 SCREAMING_SNAKE_CASE 保持一致，便于日志与错误码统一引用
        let s = match self {
            Self::Created => "CREATED",
            Self::Paid => "PAID",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// OrderEvent — 订单事件信封
// ---------------------------------------------------------------------------

/// 订单生命周期事件
///
/// `order_id` 是稳定的实体键，作为 Kafka 消息 key 保证同一订单的事件
/// 落在同一分区、按序投递；`sequence` 是实体内单调递增的应用序号，
/// 定序器据此实现乱序恢复与幂等去重。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    /// 实体键，用于分区亲和与顺序保证
    pub order_id: String,
    /// 下单用户 ID
    pub customer_id: String,
    /// 目标状态
    pub status: OrderStatus,
    /// 人类可读的状态描述
    pub description: String,
    /// 事件发生时间
    pub timestamp: DateTime<Utc>,
    /// 实体内单调递增的序号，从 1 开始
    pub sequence: u64,
    /// 信封 schema 版本，缺省视为 1
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl OrderEvent {
    fn build(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        status: OrderStatus,
        description: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            status,
            description: description.into(),
            timestamp: Utc::now(),
            sequence,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// 创建新订单事件
    ///
    /// order_id 使用 UUID v7 生成：时间有序且无碰撞风险，
    /// 避免截断随机串做短 ID 带来的冲突问题。CREATED 恒为 seq=1。
    pub fn created(customer_id: impl Into<String>) -> Self {
        Self::build(
            Uuid::now_v7().to_string(),
            customer_id,
            OrderStatus::Created,
            "订单已创建",
            1,
        )
    }

    /// 以指定 order_id 创建订单事件（用于上游已分配订单号的场景）
    pub fn created_with_id(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
    ) -> Self {
        Self::build(order_id, customer_id, OrderStatus::Created, "订单已创建", 1)
    }

    /// 支付完成事件
    pub fn paid(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self::build(order_id, customer_id, OrderStatus::Paid, "支付已完成", sequence)
    }

    /// 配送开始事件
    pub fn shipped(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self::build(
            order_id,
            customer_id,
            OrderStatus::Shipped,
            "配送已开始",
            sequence,
        )
    }

    /// 配送完成事件
    pub fn delivered(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self::build(
            order_id,
            customer_id,
            OrderStatus::Delivered,
            "配送已完成",
            sequence,
        )
    }

    /// 订单取消事件，描述中携带取消原因
    pub fn cancelled(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        sequence: u64,
        reason: &str,
    ) -> Self {
        Self::build(
            order_id,
            customer_id,
            OrderStatus::Cancelled,
            format!("订单已取消: {reason}"),
            sequence,
        )
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transition_reachability() {
        use OrderStatus::*;

        // 正向全序
        assert!(Created.can_transition_to(Paid));
        assert!(Paid.can_transition_to(Shipped));
        assert!(Shipped.can_transition_to(Delivered));

        // CANCELLED 仅可从 CREATED / PAID 到达
        assert!(Created.can_transition_to(Cancelled));
        assert!(Paid.can_transition_to(Cancelled));
        assert!(!Shipped.can_transition_to(Cancelled));
        assert!(!Delivered.can_transition_to(Cancelled));

        // 不可跳步、不可回退
        assert!(!Created.can_transition_to(Shipped));
        assert!(!Created.can_transition_to(Delivered));
        assert!(!Paid.can_transition_to(Created));
        assert!(!Delivered.can_transition_to(Paid));

        // 终态不再转移
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(!Delivered.can_transition_to(Delivered));
    }

    #[test]
    fn test_is_terminal() {
        assert!(OrderStatus::Delivered.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Created.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
        assert!(!OrderStatus::Shipped.is_terminal());
    }

    #[test]
    fn test_event_serialization_camel_case() {
        let event = OrderEvent::paid("ord-1", "cust-1", 2);
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("orderId"));
        assert!(json.contains("customerId"));
        assert!(json.contains("schemaVersion"));
        assert!(json.contains("\"PAID\""));

        let back: OrderEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.order_id, "ord-1");
        assert_eq!(back.customer_id, "cust-1");
        assert_eq!(back.status, OrderStatus::Paid);
        assert_eq!(back.sequence, 2);
        assert_eq!(back.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_deserialization_tolerates_unknown_fields() {
        // 向前兼容：新版本生产者可能追加字段，旧消费者须能照常解析
        let json = r#"{
            "orderId": "ord-2",
            "customerId": "cust-2",
            "status": "SHIPPED",
            "description": "配送已开始",
            "timestamp": "2025-01-15T10:30:00Z",
            "sequence": 3,
            "schemaVersion": 2,
            "carrier": "express",
            "extra": {"nested": true}
        }"#;

        let event: OrderEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.order_id, "ord-2");
        assert_eq!(event.status, OrderStatus::Shipped);
        assert_eq!(event.sequence, 3);
        assert_eq!(event.schema_version, 2);
    }

    #[test]
    fn test_deserialization_defaults_schema_version() {
        // 旧生产者未携带 schemaVersion 时按版本 1 处理
        let json = r#"{
            "orderId": "ord-3",
            "customerId": "cust-3",
            "status": "CREATED",
            "description": "订单已创建",
            "timestamp": "2025-01-15T10:30:00Z",
            "sequence": 1
        }"#;

        let event: OrderEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.schema_version, 1);
    }

    #[test]
    fn test_created_generates_unique_order_ids() {
        let a = OrderEvent::created("cust-1");
        let b = OrderEvent::created("cust-1");

        assert_ne!(a.order_id, b.order_id);
        assert_eq!(a.sequence, 1);
        assert_eq!(a.status, OrderStatus::Created);
        assert_eq!(a.description, "订单已创建");
    }

    #[test]
    fn test_cancelled_carries_reason() {
        let event = OrderEvent::cancelled("ord-4", "cust-4", 2, "客户要求");
        assert_eq!(event.status, OrderStatus::Cancelled);
        assert_eq!(event.description, "订单已取消: 客户要求");
    }
}
