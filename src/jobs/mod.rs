//! 单作业执行：状态机、协作式取消、续跑

pub mod controller;
pub mod model;

pub use controller::JobController;
pub use model::{JobId, JobRecord, JobStatus};
