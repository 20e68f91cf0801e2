//! 轮次循环：执行器、进度事件与会话写入租约

pub mod events;
pub mod executor;
pub mod lease;

pub use events::RoundEvent;
pub use executor::{
    ForceReason, PreparedRound, RoundExecutor, RoundOutcome, RunWindow, FINAL_ANSWER_INSTRUCTION,
    NOTE_NO_TOOL_CALLS,
};
pub use lease::{SessionLease, SessionLeases};
