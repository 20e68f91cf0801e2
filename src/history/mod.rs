//! 轮次历史：会话/轮次数据模型、追加式存储（内存 / JSONL）、上下文回放

pub mod context;
pub mod jsonl;
pub mod model;
pub mod store;

pub use context::{Context, ContextEntry, ToolOutcome};
pub use jsonl::JsonlRoundStore;
pub use model::{
    ArtifactRef, Backend, Round, SessionId, SessionMeta, ToolCallRecord, ToolCallStatus,
    ToolFailure,
};
pub use store::{MemoryRoundStore, RoundStore, StoreError};
