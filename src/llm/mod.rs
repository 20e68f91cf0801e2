//! 推理网关层：抽象与实现（HTTP / Scripted）

pub mod http;
pub mod mock;
pub mod traits;

pub use http::HttpGateway;
pub use mock::{RecordedCall, ScriptStep, ScriptedGateway};
pub use traits::{
    BatchHandle, BatchItem, BatchPoll, GatewayError, InferenceGateway, ModelReply, ToolRequest,
};
