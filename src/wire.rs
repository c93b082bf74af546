//! Wire payloads exchanged with the host-side deployer.
//!
//! Requests arrive on the request queue, responses leave on the paired
//! response queue, and per-model status/exception reports leave on the
//! status output queue. All payloads are serde-encoded tagged unions.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult, CODE_SUCCESS};
use crate::manifest::QueueDevInfo;

/// Kind carried by a clear-model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearKind {
    Suspend,
    Recover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionNotify {
    pub kind: ExceptionKind,
    pub trans_id: u64,
    pub user_context_id: u64,
    pub exception_code: i32,
    pub scope: String,
    #[serde(default)]
    pub context: Vec<u8>,
}

/// Request-queue message set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorRequest {
    ClearModel { kind: ClearKind },
    Exception(ExceptionNotify),
    Notify,
}

/// Response-queue message: status code plus a human-readable summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResponse {
    pub status_code: i32,
    pub error_message: String,
}

impl ExecutorResponse {
    /// Builds the canonical response text for a command outcome, e.g.
    /// `"Execute suspend success."` or `"Parse control message failed."`.
    pub fn for_command(command: ResponseCommand, code: i32) -> Self {
        let verb = match command {
            ResponseCommand::Init => "Execute init",
            ResponseCommand::Suspend => "Execute suspend",
            ResponseCommand::Recover => "Execute recover",
            ResponseCommand::Exception => "Execute exception message",
            ResponseCommand::Unknown => "Parse control message",
        };
        let suffix = if code == CODE_SUCCESS { "success" } else { "failed" };
        Self {
            status_code: code,
            error_message: format!("{verb} {suffix}."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCommand {
    Init,
    Suspend,
    Recover,
    Exception,
    Unknown,
}

impl From<ClearKind> for ResponseCommand {
    fn from(kind: ClearKind) -> Self {
        match kind {
            ClearKind::Suspend => ResponseCommand::Suspend,
            ClearKind::Recover => ResponseCommand::Recover,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttrs {
    pub queue_id: u32,
    pub device_type: i32,
    pub device_id: u32,
    pub logic_id: u32,
}

impl From<&QueueDevInfo> for QueueAttrs {
    fn from(info: &QueueDevInfo) -> Self {
        Self {
            queue_id: info.queue_id,
            device_type: info.device_type,
            device_id: info.device_id,
            logic_id: info.logic_queue_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_depth: u32,
    pub input_consume_num: u64,
    pub queue_attrs: QueueAttrs,
}

/// Status-output queue message set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmodelStatus {
    ReportStatus {
        model_uuid: u32,
        queue_statuses: Vec<QueueStatus>,
    },
    RaiseException(ExceptionNotify),
}

pub fn encode<T: Serialize>(value: &T) -> FlowResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| FlowError::Internal(format!("encode wire message: {e}")))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> FlowResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| FlowError::ParamInvalid(format!("decode wire message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_decodes_each_variant() {
        let suspend = encode(&ExecutorRequest::ClearModel {
            kind: ClearKind::Suspend,
        })
        .unwrap();
        assert_eq!(
            decode::<ExecutorRequest>(&suspend).unwrap(),
            ExecutorRequest::ClearModel {
                kind: ClearKind::Suspend
            }
        );

        let exc = encode(&ExecutorRequest::Exception(ExceptionNotify {
            kind: ExceptionKind::Add,
            trans_id: 11,
            user_context_id: 22,
            exception_code: -5,
            scope: "root/sub".into(),
            context: vec![1, 2, 3],
        }))
        .unwrap();
        match decode::<ExecutorRequest>(&exc).unwrap() {
            ExecutorRequest::Exception(n) => {
                assert_eq!(n.trans_id, 11);
                assert_eq!(n.context, vec![1, 2, 3]);
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn garbage_is_param_invalid() {
        let err = decode::<ExecutorRequest>(b"not json").unwrap_err();
        assert_eq!(err.code(), FlowError::ParamInvalid(String::new()).code());
    }

    #[test]
    fn response_text_matches_outcome() {
        let ok = ExecutorResponse::for_command(ResponseCommand::Suspend, 0);
        assert_eq!(ok.error_message, "Execute suspend success.");
        let bad = ExecutorResponse::for_command(ResponseCommand::Unknown, 3);
        assert_eq!(bad.error_message, "Parse control message failed.");
        assert_eq!(bad.status_code, 3);
    }
}
