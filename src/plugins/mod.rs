//! The evaluation stages, leaf components first.

pub mod classify;
pub mod dedup;
pub mod dispatch;
pub mod encode;
pub mod flags;
pub mod metrics;
pub mod tool_call;
