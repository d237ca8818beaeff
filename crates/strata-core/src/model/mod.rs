pub mod agent;
pub mod context;
pub mod event;
pub mod message;
pub mod snapshot;
pub mod tool_call;
