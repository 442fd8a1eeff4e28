//! JSON-RPC message helpers on top of `lsp-server`.

use crossbeam_channel::Sender;
use lsp_server::{Message, Notification, RequestId, Response, ResponseError};
use serde::Serialize;

use crate::error::ExplorerError;

/// Tree changes for the test explorer.
pub const TEST_TREE: &str = "$/testTree";
/// Run lifecycle updates for the test explorer.
pub const TEST_RUN: &str = "$/testRun";
/// Prefix of commands addressed to the test process.
pub const RUNNER_PREFIX: &str = "$/runner/";

/// Send a notification through the connection's outgoing queue.
pub fn notify<T>(sender: &Sender<Message>, method: &str, params: &T) -> Result<(), ExplorerError>
where
    T: ?Sized + Serialize + std::fmt::Debug,
{
    log::debug!("send {method}: {params:?}");
    let params = serde_json::to_value(params)?;
    sender.send(Message::Notification(Notification::new(method.to_string(), params)))?;
    Ok(())
}

/// Send a successful response.
pub fn respond<T>(sender: &Sender<Message>, id: RequestId, result: &T) -> Result<(), ExplorerError>
where
    T: ?Sized + Serialize,
{
    let result = serde_json::to_value(result)?;
    sender.send(Message::Response(Response::new_ok(id, result)))?;
    Ok(())
}

/// Send a JSON-RPC error response.
pub fn respond_error<S: Into<String>>(
    sender: &Sender<Message>,
    id: RequestId,
    code: i32,
    msg: S,
) -> Result<(), ExplorerError> {
    sender.send(Message::Response(Response {
        id,
        result: None,
        error: Some(ResponseError {
            code,
            message: msg.into(),
            data: None,
        }),
    }))?;
    Ok(())
}
