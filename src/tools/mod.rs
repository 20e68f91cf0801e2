pub mod dispatcher;
pub mod echo;
pub mod lookup;
pub mod registry;

pub use dispatcher::{summarize, ToolDispatcher};
pub use echo::EchoTool;
pub use lookup::HttpLookupTool;
pub use registry::{Tool, ToolRegistry, ToolSpec};

use crate::config::ToolsSection;

/// 按配置组装注册表：echo + 每个 [[tools.lookups]] 一个 HTTP 检索工具
pub fn build_registry(cfg: &ToolsSection) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    for section in &cfg.lookups {
        registry.register(HttpLookupTool::from_section(
            section,
            cfg.timeout_secs,
            cfg.max_body_chars,
        ));
    }
    registry
}
