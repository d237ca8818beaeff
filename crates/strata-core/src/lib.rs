pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod query;
pub mod retry;
pub mod storage;
pub mod timeline;

pub use error::{Error, Result};
pub use query::StrataEngine;
