//! Control channel wire format.
//!
//! 4-byte big-endian length prefix followed by a UTF-8 JSON-RPC 2.0 payload.
//! Both peers send requests and responses on the same connection, so a frame
//! is either one.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::ControlConfig;
use crate::error::{LocalSyncError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// JSON-RPC 2.0 request. Without `id` it is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl IpcRequest {
    /// Create a request expecting a reply.
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(id),
        }
    }

    /// Create a notification.
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    pub id: Option<u64>,
}

impl IpcResponse {
    /// Create a success response.
    pub fn success(id: Option<u64>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<u64>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(IpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Any frame on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcFrame {
    Request(IpcRequest),
    Response(IpcResponse),
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ControlConfig::MAX_FRAME_SIZE {
        return Err(LocalSyncError::Validation {
            field: "ipc_frame".to_string(),
            message: format!(
                "control frame size {} exceeds maximum {}",
                len,
                ControlConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse one frame payload.
pub fn parse_frame(payload: &[u8]) -> Result<IpcFrame> {
    let frame: IpcFrame = serde_json::from_slice(payload)?;
    let jsonrpc = match &frame {
        IpcFrame::Request(req) => &req.jsonrpc,
        IpcFrame::Response(resp) => &resp.jsonrpc,
    };
    if jsonrpc != "2.0" {
        return Err(LocalSyncError::Validation {
            field: "jsonrpc".to_string(),
            message: "Invalid Request: expected jsonrpc 2.0".to_string(),
        });
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_parses_as_request() {
        let req = IpcRequest::new("sendMsg", serde_json::json!({"offset": 0}), 7);
        let bytes = serde_json::to_vec(&req).unwrap();
        match parse_frame(&bytes).unwrap() {
            IpcFrame::Request(parsed) => {
                assert_eq!(parsed.method, "sendMsg");
                assert_eq!(parsed.id, Some(7));
            }
            other => panic!("Expected request, got: {:?}", other),
        }
    }

    #[test]
    fn test_response_frame_parses_as_response() {
        let resp = IpcResponse::success(Some(3), serde_json::json!({"ok": true}));
        let bytes = serde_json::to_vec(&resp).unwrap();
        match parse_frame(&bytes).unwrap() {
            IpcFrame::Response(parsed) => {
                assert_eq!(parsed.id, Some(3));
                assert!(parsed.error.is_none());
            }
            other => panic!("Expected response, got: {:?}", other),
        }
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = IpcRequest::notification("logOutput", serde_json::json!({}));
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = IpcResponse::error(Some(1), -32603, "Internal error".to_string());
        let json = serde_json::to_string(&resp).unwrap();

        assert!(!json.contains("\"result\""));
        assert!(json.contains("\"error\""));
        assert!(json.contains("-32603"));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let bytes = br#"{"jsonrpc":"1.0","method":"x","id":1}"#;
        assert!(parse_frame(bytes).is_err());
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ControlConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
