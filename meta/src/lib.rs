pub mod coordinator;
pub mod error;
pub mod member;
pub mod metadata;
pub mod partition;
pub mod raft_log;
pub mod rpc;

pub use error::{MetaError, MetaResult};
