//! 副作用分发器
//!
//! 将已校验转移产出的副作用意图路由到对应的处理器。每种意图类型
//! 映射到恰好一个处理器；处理器至少一次被调用，失败向上抛出由泳道
//! 按退避重试——绝不静默吞掉。未注册处理器的意图同样以显式错误暴露，
//! 而非空操作。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use order_shared::error::OrderError;

use crate::engine::{SideEffect, SideEffectKind};

// ---------------------------------------------------------------------------
// SideEffectHandler trait
// ---------------------------------------------------------------------------

/// 副作用处理器抽象
///
/// 每个实现对应一种下游能力（库存、支付、配送、通知、退款）。
/// 使用 trait object 注册到分发器，避免泛型传播到整个调用链。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    /// 执行副作用。调用语义为至少一次，实现方需自行保证可重入。
    async fn handle(&self, effect: &SideEffect) -> Result<(), OrderError>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// 副作用分发器
///
/// 意图类型到处理器的注册表。分发本身不做重试，失败结果原样上抛，
/// 由调用方（泳道）套用重试策略并在耗尽后写入死信队列。
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<SideEffectKind, Arc<dyn SideEffectHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册某种意图类型的处理器，重复注册以后者为准
    pub fn register(
        mut self,
        kind: SideEffectKind,
        handler: Arc<dyn SideEffectHandler>,
    ) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// 已注册的意图类型集合
    pub fn registered_kinds(&self) -> Vec<SideEffectKind> {
        self.handlers.keys().copied().collect()
    }

    /// 将意图分发到对应处理器
    ///
    /// 未注册处理器返回 handler-failure：演示工程里空的 switch 分支
    /// 在这里是缺陷而非模型，缺失必须显式报错。
    pub async fn dispatch(&self, effect: &SideEffect) -> Result<(), OrderError> {
        let handler = self
            .handlers
            .get(&effect.kind)
            .ok_or_else(|| OrderError::Handler {
                kind: effect.kind.to_string(),
                message: "未注册处理器".to_string(),
            })?;

        debug!(
            kind = %effect.kind,
            order_id = %effect.order_id,
            triggered_by = %effect.triggered_by,
            "分发副作用意图"
        );

        handler.handle(effect).await.map_err(|e| match e {
            // 处理器内部错误统一归入 handler-failure，保留原因描述
            OrderError::Handler { .. } => e,
            other => OrderError::Handler {
                kind: effect.kind.to_string(),
                message: other.to_string(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
