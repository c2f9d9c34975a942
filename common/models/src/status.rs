use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Structured result codes carried by [`TsStatus`]. The numeric values
/// round-trip on the wire and must stay stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    MultipleError,
    TimeseriesNotExist,
    ExecuteStatementError,
    InternalServerError,
    TimeOut,
    NoLeader,
    NoStorageGroup,
    PartitionTableNotReady,
    ConsistencyFailure,
    UnsupportedOperation,
}

/// Execution status of one non-query request. Batch operations carry a
/// per-row `sub_status` vector; forwarded requests may carry the endpoint
/// the client should talk to next time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TsStatus {
    pub code: StatusCode,
    pub message: String,
    pub sub_status: Vec<TsStatus>,
    pub redirect_node: Option<(String, u16)>,
}

impl TsStatus {
    pub fn ok() -> Self {
        Self::new(StatusCode::Success, String::new())
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sub_status: vec![],
            redirect_node: None,
        }
    }

    pub fn multiple_error(sub_status: Vec<TsStatus>) -> Self {
        Self {
            code: StatusCode::MultipleError,
            message: String::new(),
            sub_status,
            redirect_node: None,
        }
    }

    pub fn time_out() -> Self {
        Self::new(StatusCode::TimeOut, "request timed out")
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn with_redirect(mut self, host: impl Into<String>, port: u16) -> Self {
        self.redirect_node = Some((host.into(), port));
        self
    }
}

impl Display for TsStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}
