//! 轮次存储抽象层
//!
//! 统一的追加式轮次日志接口，支持内存与 JSONL 文件两种实现。
//! 每个会话单写者；不同会话之间的写入互不阻塞（外层索引只做短暂的查找）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::history::{Context, Round, SessionMeta};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid session id: {0}")]
    InvalidId(String),

    #[error("Out-of-order round for session {session_id}: expected {expected}, got {got}")]
    OutOfOrder {
        session_id: String,
        expected: u32,
        got: u32,
    },

    #[error("Session {0} already has a final round")]
    SessionClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 轮次存储接口
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// 创建会话（写入会话头）
    async fn create_session(&self, meta: &SessionMeta) -> Result<(), StoreError>;

    /// 读取会话头
    async fn session(&self, session_id: &str) -> Result<SessionMeta, StoreError>;

    /// 追加一轮；返回前已持久化
    async fn append(&self, session_id: &str, round: &Round) -> Result<(), StoreError>;

    /// 按 round_index 顺序读取全部轮次
    async fn load(&self, session_id: &str) -> Result<Vec<Round>, StoreError>;

    /// 回放全部轮次，得到下一轮可用的上下文
    async fn build_context(&self, session_id: &str) -> Result<Context, StoreError> {
        let meta = self.session(session_id).await?;
        let rounds = self.load(session_id).await?;
        Ok(Context::replay(&meta, &rounds))
    }
}

/// 会话日志尾部状态：最后一轮序号、是否已终局
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Tail {
    pub last: u32,
    pub closed: bool,
}

impl Tail {
    pub fn of(rounds: &[Round]) -> Self {
        rounds
            .last()
            .map(|r| Tail {
                last: r.round_index,
                closed: r.is_final,
            })
            .unwrap_or_default()
    }

    /// 校验追加：序号必须为 last+1，终局轮之后不可再写
    pub fn check(&self, session_id: &str, round: &Round) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::SessionClosed(session_id.to_string()));
        }
        let expected = self.last + 1;
        if round.round_index != expected {
            return Err(StoreError::OutOfOrder {
                session_id: session_id.to_string(),
                expected,
                got: round.round_index,
            });
        }
        Ok(())
    }

    pub fn advance(&mut self, round: &Round) {
        self.last = round.round_index;
        self.closed = round.is_final;
    }
}

/// 会话 ID 只允许字母数字与 `-` `_`，避免路径逃逸
pub(crate) fn validate_id(session_id: &str) -> Result<(), StoreError> {
    let ok = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(session_id.to_string()))
    }
}

struct MemorySession {
    meta: SessionMeta,
    rounds: Vec<Round>,
}

/// 内存轮次存储（测试与离线演示用）
#[derive(Default)]
pub struct MemoryRoundStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<MemorySession>>>>,
}

impl MemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, session_id: &str) -> Result<Arc<Mutex<MemorySession>>, StoreError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }
}

#[async_trait]
impl RoundStore for MemoryRoundStore {
    async fn create_session(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        validate_id(&meta.id)?;
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&meta.id) {
            return Err(StoreError::AlreadyExists(meta.id.clone()));
        }
        sessions.insert(
            meta.id.clone(),
            Arc::new(Mutex::new(MemorySession {
                meta: meta.clone(),
                rounds: Vec::new(),
            })),
        );
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<SessionMeta, StoreError> {
        let session = self.get(session_id).await?;
        let guard = session.lock().await;
        Ok(guard.meta.clone())
    }

    async fn append(&self, session_id: &str, round: &Round) -> Result<(), StoreError> {
        let session = self.get(session_id).await?;
        let mut guard = session.lock().await;
        Tail::of(&guard.rounds).check(session_id, round)?;
        guard.rounds.push(round.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<Round>, StoreError> {
        let session = self.get(session_id).await?;
        let guard = session.lock().await;
        Ok(guard.rounds.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ArtifactRef;

    #[tokio::test]
    async fn test_memory_store_append_and_load() {
        let store = MemoryRoundStore::new();
        let meta = SessionMeta::new(ArtifactRef::new("a.png"));
        store.create_session(&meta).await.unwrap();

        store
            .append(&meta.id, &Round::intermediate(1, "r1".into(), vec![]))
            .await
            .unwrap();
        store
            .append(&meta.id, &Round::intermediate(2, "r2".into(), vec![]))
            .await
            .unwrap();

        let rounds = store.load(&meta.id).await.unwrap();
        let indices: Vec<u32> = rounds.iter().map(|r| r.round_index).collect();
        assert_eq!(indices, vec![1, 2]);

        let ctx = store.build_context(&meta.id).await.unwrap();
        assert_eq!(ctx.last_round(), 2);
        assert_eq!(ctx.artifact.location, "a.png");
    }

    #[tokio::test]
    async fn test_memory_store_rejects_gaps_and_post_final_writes() {
        let store = MemoryRoundStore::new();
        let meta = SessionMeta::new(ArtifactRef::new("a.png"));
        store.create_session(&meta).await.unwrap();

        let err = store
            .append(&meta.id, &Round::intermediate(2, "gap".into(), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { expected: 1, got: 2, .. }));

        store
            .append(
                &meta.id,
                &Round::terminal(1, "done".into(), serde_json::json!({"ok": true})),
            )
            .await
            .unwrap();
        let err = store
            .append(&meta.id, &Round::intermediate(2, "late".into(), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_memory_store_unknown_session() {
        let store = MemoryRoundStore::new();
        assert!(matches!(
            store.load("missing").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.build_context("missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("3f2b-11aa_x").is_ok());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("").is_err());
    }
}
