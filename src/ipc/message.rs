use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

/// Wire unit exchanged between the master and its workers.
///
/// A response is the request it answers, turned around: same `id`,
/// `reqPid`, `method` and `args`, with `error`/`result`/`resPid` filled in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpcMessage {
    /// Correlation id. Zero for messages that expect no reply.
    #[serde(default)]
    pub id: u64,
    pub req_pid: i32,
    pub method: String,
    #[serde(default)]
    pub args: Value,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_pid: Option<i32>,
}

impl IpcMessage {
    pub fn request(id: u64, req_pid: i32, method: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            req_pid,
            method: method.into(),
            args,
            kind: MessageKind::Request,
            error: None,
            result: None,
            res_pid: None,
        }
    }

    pub fn into_response(
        mut self,
        res_pid: i32,
        error: Option<String>,
        result: Option<Value>,
    ) -> Self {
        self.kind = MessageKind::Response;
        self.res_pid = Some(res_pid);
        self.error = error;
        self.result = result;
        self
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }
}
