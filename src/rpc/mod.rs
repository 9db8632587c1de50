//! Driver RPC (C7's stdio surface): a line-delimited JSON request per
//! line on stdin, one JSON response line per request on stdout. The
//! wire framing itself is out of scope (spec.md §1 calls it an
//! external collaborator); this module supplies one concrete
//! implementation so the bridge runs standalone. Grounded on the
//! teacher's `server/device.rs` single-writer-task discipline, applied
//! here to stdout instead of a WebSocket sink so two commands
//! resolving concurrently never interleave partial response lines.

use crate::error::BridgeError;
use crate::manager::CallManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    id: Value,
    #[serde(rename = "isError")]
    is_error: bool,
    text: String,
}

#[derive(Debug, Deserialize)]
struct InitiateParams {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ContinueParams {
    call_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SpeakParams {
    call_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EndParams {
    call_id: String,
    #[serde(default)]
    message: String,
}

/// Read requests from stdin, dispatch each against `manager`
/// concurrently, and serialize replies onto one writer task. A
/// malformed line produces an error response rather than killing the
/// loop.
pub async fn run(manager: Arc<CallManager>) -> Result<(), BridgeError> {
    let (tx, mut rx) = mpsc::channel::<String>(32);

    let writer_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await.map_err(anyhow::Error::from)? {
        if line.trim().is_empty() {
            continue;
        }
        let manager = manager.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response_line = dispatch(&manager, &line).await;
            let _ = tx.send(response_line).await;
        });
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

async fn dispatch(manager: &Arc<CallManager>, line: &str) -> String {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return encode_error(Value::Null, &format!("malformed request: {e}"));
        }
    };

    let id = request.id.clone();
    match handle_tool(manager, &request.tool, request.params).await {
        Ok(result) => serde_json::to_string(&SuccessResponse { id, result }).unwrap_or_default(),
        Err(e) => encode_error(id, &e.driver_text()),
    }
}

fn encode_error(id: Value, text: &str) -> String {
    serde_json::to_string(&ErrorResponse { id, is_error: true, text: text.to_string() }).unwrap_or_default()
}

/// Dispatch one tool call. Mirrors spec.md §5's four Driver verbs;
/// `send_text` (SMS) is advertised but unimplemented, matching §1's
/// explicit non-goal.
async fn handle_tool(manager: &Arc<CallManager>, tool: &str, params: Value) -> Result<Value, BridgeError> {
    match tool {
        "initiate_call" => {
            let params: InitiateParams = parse_params(params)?;
            let (call_id, response) = manager.initiate_call(&params.message).await?;
            Ok(serde_json::json!({ "callId": call_id.as_str(), "response": response }))
        }
        "continue_call" => {
            let params: ContinueParams = parse_params(params)?;
            let response = manager.continue_call(&params.call_id, &params.message).await?;
            Ok(serde_json::json!({ "callId": params.call_id, "response": response }))
        }
        "speak_to_user" => {
            let params: SpeakParams = parse_params(params)?;
            manager.speak_to_user(&params.call_id, &params.message).await?;
            Ok(serde_json::json!({ "callId": params.call_id, "ok": true }))
        }
        "end_call" => {
            let params: EndParams = parse_params(params)?;
            manager.end_call(&params.call_id, &params.message).await?;
            Ok(serde_json::json!({ "callId": params.call_id, "ok": true }))
        }
        "send_text" => Err(BridgeError::Other(anyhow::anyhow!(
            "send_text (SMS) is out of scope for this bridge"
        ))),
        other => Err(BridgeError::Other(anyhow::anyhow!("unknown tool '{other}'"))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, BridgeError> {
    serde_json::from_value(params).map_err(|e| BridgeError::Other(anyhow::anyhow!("bad params: {e}")))
}
