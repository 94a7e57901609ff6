pub mod retry;
pub mod unit_ctx;
pub mod unit_flow;

pub use retry::RetryPolicy;
pub use unit_ctx::UnitCtx;
pub use unit_flow::{FlowSettings, UnitFlow, UnitFlowOutput};
