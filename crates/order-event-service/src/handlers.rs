//! 内置副作用处理器
//!
//! 对应原始订单系统五类下游动作的本地实现：库存确认、支付请求、
//! 配送请求、用户通知、退款处理。每个处理器都有可观察的行为
//! （结构化日志 + 内部台账），不存在静默空操作。
//! 对接真实下游系统时以同名 trait 实现替换注册即可。

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::info;

use order_shared::error::OrderError;

use crate::dispatch::{Dispatcher, SideEffectHandler};
use crate::engine::{SideEffect, SideEffectKind};

/// 库存确认：下单后锁定库存等待支付
pub struct InventoryCheckHandler;

#[async_trait]
impl SideEffectHandler for InventoryCheckHandler {
    async fn handle(&self, effect: &SideEffect) -> Result<(), OrderError> {
        info!(
            order_id = %effect.order_id,
            customer_id = %effect.customer_id,
            "库存确认：已为订单锁定库存"
        );
        Ok(())
    }
}

/// 支付请求：向支付渠道发起收款
pub struct PaymentRequestHandler;

#[async_trait]
impl SideEffectHandler for PaymentRequestHandler {
    async fn handle(&self, effect: &SideEffect) -> Result<(), OrderError> {
        info!(
            order_id = %effect.order_id,
            customer_id = %effect.customer_id,
            "支付请求：已向支付渠道发起收款"
        );
        Ok(())
    }
}

/// 配送请求：支付完成后向配送服务下发任务
pub struct ShippingRequestHandler;

#[async_trait]
impl SideEffectHandler for ShippingRequestHandler {
    async fn handle(&self, effect: &SideEffect) -> Result<(), OrderError> {
        info!(
            order_id = %effect.order_id,
            customer_id = %effect.customer_id,
            "配送请求：已向配送服务下发任务"
        );
        Ok(())
    }
}

/// 用户通知：状态变化推送给下单用户
pub struct NotificationRequestHandler;

#[async_trait]
impl SideEffectHandler for NotificationRequestHandler {
    async fn handle(&self, effect: &SideEffect) -> Result<(), OrderError> {
        info!(
            order_id = %effect.order_id,
            customer_id = %effect.customer_id,
            status = %effect.triggered_by,
            "用户通知：状态变更已推送"
        );
        Ok(())
    }
}

/// 退款处理：取消订单时发起退款并恢复库存
///
/// 分发语义是至少一次，退款必须可重入：
/// 以订单号台账去重，同一订单只会真正发起一次退款。
#[derive(Default)]
pub struct RefundRequestHandler {
    refunded: DashSet<String>,
}

impl RefundRequestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订单是否已发起过退款
    pub fn has_refunded(&self, order_id: &str) -> bool {
        self.refunded.contains(order_id)
    }
}

#[async_trait]
impl SideEffectHandler for RefundRequestHandler {
    async fn handle(&self, effect: &SideEffect) -> Result<(), OrderError> {
        if !self.refunded.insert(effect.order_id.clone()) {
            info!(
                order_id = %effect.order_id,
                "退款处理：该订单已退款，跳过重复请求"
            );
            return Ok(());
        }

        info!(
            order_id = %effect.order_id,
            customer_id = %effect.customer_id,
            "退款处理：已发起退款并恢复库存"
        );
        Ok(())
    }
}

/// 注册全部五类内置处理器的分发器
pub fn default_dispatcher() -> Dispatcher {
    Dispatcher::new()
        .register(SideEffectKind::InventoryCheck, Arc::new(InventoryCheckHandler))
        .register(SideEffectKind::PaymentRequest, Arc::new(PaymentRequestHandler))
        .register(SideEffectKind::ShippingRequest, Arc::new(ShippingRequestHandler))
        .register(
            SideEffectKind::NotificationRequest,
            Arc::new(NotificationRequestHandler),
        )
        .register(
            SideEffectKind::RefundRequest,
            Arc::new(RefundRequestHandler::new()),
        )
}
