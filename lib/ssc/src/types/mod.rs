//! SSC types for the data model and backend payloads

mod card;
pub mod error;
mod wire;
pub mod workflow;

pub use card::*;
pub use error::BackendErrorClass;
pub use wire::*;
pub use workflow::{STATE_WHITELIST, WorkflowRecord, WorkflowType};
