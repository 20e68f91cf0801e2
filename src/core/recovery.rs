//! 错误恢复引擎
//!
//! 根据网关错误与已失败次数返回 RecoveryAction：可重试错误按有界指数退避重试，
//! 超过上限或不可重试时给出终止原因。

use std::time::Duration;

use crate::core::{Failure, FailureKind, RecoveryAction};
use crate::llm::GatewayError;

/// 有界单调退避：initial * multiplier^(n-1)，不超过 max
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub multiplier: u32,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 2_000,
            multiplier: 2,
            max_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// 第 failures 次失败后的等待时长（failures 从 1 开始）
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exp);
        let ms = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }
}

/// 把网关错误映射为「等待后重试」或「终止」
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    backoff: BackoffPolicy,
}

impl RecoveryEngine {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// failures：本轮已失败次数（含本次）；max_retries：本轮允许的重试次数
    pub fn handle(&self, err: &GatewayError, failures: u32, max_retries: u32) -> RecoveryAction {
        match err {
            GatewayError::Rejected(msg) => {
                RecoveryAction::Fail(Failure::new(FailureKind::UpstreamRejected, msg.clone()))
            }
            GatewayError::Transient(msg) => {
                if failures > max_retries {
                    RecoveryAction::Fail(Failure::new(
                        FailureKind::TransientUpstream,
                        format!("gateway still failing after {failures} attempts: {msg}"),
                    ))
                } else {
                    RecoveryAction::RetryAfter(self.backoff.delay(failures))
                }
            }
        }
    }

    /// 批量响应缺失某个 alias：消耗该作业自己的重试预算
    pub fn handle_omitted(&self, alias: &str, failures: u32, max_retries: u32) -> RecoveryAction {
        if failures > max_retries {
            RecoveryAction::Fail(Failure::new(
                FailureKind::UpstreamOmitted,
                format!("batch response missing for {alias} in {failures} consecutive rounds"),
            ))
        } else {
            RecoveryAction::RetryAfter(self.backoff.delay(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(BackoffPolicy {
            initial_ms: 100,
            multiplier: 3,
            max_ms: 1_000,
        })
    }

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let policy = engine().backoff().clone();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(300));
        assert_eq!(policy.delay(3), Duration::from_millis(900));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_transient_retries_until_ceiling() {
        let engine = engine();
        let err = GatewayError::Transient("503".to_string());
        assert!(matches!(
            engine.handle(&err, 1, 2),
            RecoveryAction::RetryAfter(_)
        ));
        assert!(matches!(
            engine.handle(&err, 2, 2),
            RecoveryAction::RetryAfter(_)
        ));
        match engine.handle(&err, 3, 2) {
            RecoveryAction::Fail(f) => assert_eq!(f.kind, FailureKind::TransientUpstream),
            other => panic!("Expected Fail, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_fails_immediately() {
        let engine = engine();
        let err = GatewayError::Rejected("bad reply".to_string());
        match engine.handle(&err, 1, 5) {
            RecoveryAction::Fail(f) => {
                assert_eq!(f.kind, FailureKind::UpstreamRejected);
                assert!(f.reason.contains("bad reply"));
            }
            other => panic!("Expected Fail, got {:?}", other),
        }
    }

    #[test]
    fn test_omitted_consumes_budget() {
        let engine = engine();
        assert!(matches!(
            engine.handle_omitted("doc_1", 1, 1),
            RecoveryAction::RetryAfter(_)
        ));
        match engine.handle_omitted("doc_1", 2, 1) {
            RecoveryAction::Fail(f) => assert_eq!(f.kind, FailureKind::UpstreamOmitted),
            other => panic!("Expected Fail, got {:?}", other),
        }
    }
}
