//! Wire protocol types and the envelope codec.
//!
//! Every logical message on a peer connection is an **envelope**: a JSON
//! object `{"type": "...", "data": "..."}` where `data` is the inner payload
//! serialized *independently* and embedded as a string. Envelopes travel as
//! one text line each, terminated by a single `\n`. The two-step layout lets
//! a receiver parse `type` first and pick the matching payload deserializer
//! without a dynamic schema.
//!
//! Bulk file bytes are not enveloped. After a `TRANSFER_START` message the
//! raw content flows on the same stream for exactly `fileSize` bytes, then
//! envelope traffic resumes with `TRANSFER_COMPLETE`.
//!
//! Field names on the wire are camelCase and case-sensitive; unknown fields
//! in a payload are ignored, an unknown `type` is a protocol error.

use serde::{Deserialize, Serialize};

use crate::error::{ShareError, ShareResult};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Protocol version advertised in the handshake and the TXT record.
pub const PROTOCOL_VERSION: &str = "1.0";

/// DNS-SD service type browsed and registered on the local domain.
pub const SERVICE_TYPE: &str = "_p2p-file-share._tcp.local.";

/// TXT record keys attached to the registered service.
pub const TXT_DEVICE_ID: &str = "deviceId";
pub const TXT_NICKNAME: &str = "nickname";
pub const TXT_VERSION: &str = "version";

/// Default TCP port the node listens on for peer connections.
pub const DEFAULT_PORT: u16 = 8888;

/// Bulk transfer chunk size, also advertised in `TRANSFER_START`.
pub const CHUNK_SIZE: u32 = 8192;

/// Cap on a single envelope line to bound allocations from a misbehaving
/// peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Deadline for establishing an outbound connection.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Inactivity deadline on session I/O; resets on any successful read or
/// write.
pub const IDLE_TIMEOUT_SECS: u64 = 30;

/// Accept-loop poll window so shutdown is observed promptly.
pub const ACCEPT_POLL_SECS: u64 = 5;

/// Cap on simultaneous inbound sessions; excess connections are accepted
/// and immediately dropped.
pub const MAX_INBOUND_SESSIONS: usize = 32;

// ────────────────────────────────────────────────────────────────────────────
// Shared data model
// ────────────────────────────────────────────────────────────────────────────

/// An indexed file under the shared root, as listed to remote peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    /// Stable identifier: UUID v5 (nil namespace) of `relative_path`, so the
    /// id survives restarts for an unchanged layout.
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// POSIX-style path relative to the shared root; no leading separator.
    pub relative_path: String,
    /// Milliseconds since the UNIX epoch.
    pub last_modified: u64,
}

/// A peer observed on the LAN via discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePeer {
    pub device_id: String,
    pub nickname: String,
    /// IP literal without the port.
    pub address: String,
    pub port: u16,
    pub online: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Envelope
// ────────────────────────────────────────────────────────────────────────────

/// Outer wire object. `data` holds the inner payload pre-serialized to a
/// JSON string.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Payloads
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub device_id: String,
    pub nickname: String,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub device_id: String,
    pub nickname: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    pub files: Vec<SharedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub file_id: String,
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStart {
    pub transfer_id: String,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
}

/// Sender-side progress report. This node never emits it but tolerates
/// receiving one anywhere an envelope loop runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComplete {
    pub transfer_id: String,
    pub file_id: String,
    /// Reserved; never populated and ignored on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAck {
    pub transfer_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    pub error_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTransfer {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCancelled {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Milliseconds since the UNIX epoch; echoed back verbatim.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub timestamp: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Message
// ────────────────────────────────────────────────────────────────────────────

/// Every message a peer connection can carry, one variant per wire `type`.
#[derive(Debug, Clone)]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    ListFiles,
    FileList(FileList),
    TransferRequest(TransferRequest),
    TransferStart(TransferStart),
    TransferProgress(TransferProgress),
    TransferComplete(TransferComplete),
    TransferAck(TransferAck),
    TransferError(TransferError),
    CancelTransfer(CancelTransfer),
    TransferCancelled(TransferCancelled),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// The literal wire `type` string.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "HANDSHAKE",
            Message::HandshakeAck(_) => "HANDSHAKE_ACK",
            Message::ListFiles => "LIST_FILES",
            Message::FileList(_) => "FILE_LIST",
            Message::TransferRequest(_) => "TRANSFER_REQUEST",
            Message::TransferStart(_) => "TRANSFER_START",
            Message::TransferProgress(_) => "TRANSFER_PROGRESS",
            Message::TransferComplete(_) => "TRANSFER_COMPLETE",
            Message::TransferAck(_) => "TRANSFER_ACK",
            Message::TransferError(_) => "TRANSFER_ERROR",
            Message::CancelTransfer(_) => "CANCEL_TRANSFER",
            Message::TransferCancelled(_) => "TRANSFER_CANCELLED",
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
        }
    }

    /// Serialize to one newline-terminated envelope line.
    pub fn encode_line(&self) -> String {
        let data = match self {
            Message::Handshake(p) => to_data(p),
            Message::HandshakeAck(p) => to_data(p),
            Message::ListFiles => "{}".to_string(),
            Message::FileList(p) => to_data(p),
            Message::TransferRequest(p) => to_data(p),
            Message::TransferStart(p) => to_data(p),
            Message::TransferProgress(p) => to_data(p),
            Message::TransferComplete(p) => to_data(p),
            Message::TransferAck(p) => to_data(p),
            Message::TransferError(p) => to_data(p),
            Message::CancelTransfer(p) => to_data(p),
            Message::TransferCancelled(p) => to_data(p),
            Message::Ping(p) => to_data(p),
            Message::Pong(p) => to_data(p),
        };
        let envelope = Envelope {
            kind: self.type_tag().to_string(),
            data,
        };
        let mut line =
            serde_json::to_string(&envelope).expect("envelope serialisation is infallible");
        line.push('\n');
        line
    }

    /// Parse one envelope line (with or without its trailing newline).
    pub fn decode_line(line: &str) -> ShareResult<Message> {
        let envelope: Envelope = serde_json::from_str(line.trim_end_matches(['\r', '\n']))
            .map_err(|e| ShareError::MalformedFrame(e.to_string()))?;

        let msg = match envelope.kind.as_str() {
            "HANDSHAKE" => Message::Handshake(from_data(&envelope)?),
            "HANDSHAKE_ACK" => Message::HandshakeAck(from_data(&envelope)?),
            "LIST_FILES" => Message::ListFiles,
            "FILE_LIST" => Message::FileList(from_data(&envelope)?),
            "TRANSFER_REQUEST" => Message::TransferRequest(from_data(&envelope)?),
            "TRANSFER_START" => Message::TransferStart(from_data(&envelope)?),
            "TRANSFER_PROGRESS" => Message::TransferProgress(from_data(&envelope)?),
            "TRANSFER_COMPLETE" => Message::TransferComplete(from_data(&envelope)?),
            "TRANSFER_ACK" => Message::TransferAck(from_data(&envelope)?),
            "TRANSFER_ERROR" => Message::TransferError(from_data(&envelope)?),
            "CANCEL_TRANSFER" => Message::CancelTransfer(from_data(&envelope)?),
            "TRANSFER_CANCELLED" => Message::TransferCancelled(from_data(&envelope)?),
            "PING" => Message::Ping(from_data(&envelope)?),
            "PONG" => Message::Pong(from_data(&envelope)?),
            other => return Err(ShareError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }
}

fn to_data<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).expect("payload serialisation is infallible")
}

fn from_data<T: for<'de> Deserialize<'de>>(envelope: &Envelope) -> ShareResult<T> {
    serde_json::from_str(&envelope.data).map_err(|e| ShareError::PayloadDecodeFailed {
        kind: envelope.kind.clone(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_outer_type_plus_string_data() {
        let line = Message::Ping(Ping { timestamp: 42 }).encode_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let outer: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(outer["type"], "PING");
        // The payload must be embedded as a *string*, not a nested object.
        let data = outer["data"].as_str().unwrap();
        let inner: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(inner["timestamp"], 42);
    }

    #[test]
    fn round_trip_preserves_type_and_fields() {
        let original = Message::TransferStart(TransferStart {
            transfer_id: "t-1".into(),
            file_id: "f-1".into(),
            file_name: "hello.txt".into(),
            file_size: 3,
            chunk_size: CHUNK_SIZE,
        });
        let line = original.encode_line();
        match Message::decode_line(&line).unwrap() {
            Message::TransferStart(p) => {
                assert_eq!(p.transfer_id, "t-1");
                assert_eq!(p.file_id, "f-1");
                assert_eq!(p.file_name, "hello.txt");
                assert_eq!(p.file_size, 3);
                assert_eq!(p.chunk_size, 8192);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn round_trip_file_list() {
        let msg = Message::FileList(FileList {
            files: vec![SharedFile {
                file_id: "id".into(),
                name: "a.txt".into(),
                size: 10,
                mime_type: "text/plain".into(),
                relative_path: "docs/a.txt".into(),
                last_modified: 1_700_000_000_000,
            }],
        });
        let decoded = Message::decode_line(&msg.encode_line()).unwrap();
        match decoded {
            Message::FileList(list) => {
                assert_eq!(list.files.len(), 1);
                assert_eq!(list.files[0].relative_path, "docs/a.txt");
                assert_eq!(list.files[0].mime_type, "text/plain");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let line = Message::TransferRequest(TransferRequest {
            file_id: "f".into(),
            transfer_id: "t".into(),
        })
        .encode_line();
        let outer: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let data = outer["data"].as_str().unwrap();
        assert!(data.contains("\"fileId\""));
        assert!(data.contains("\"transferId\""));
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let line = r#"{"type":"PONG","data":"{\"timestamp\":7,\"futureField\":true}"}"#;
        match Message::decode_line(line).unwrap() {
            Message::Pong(p) => assert_eq!(p.timestamp, 7),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        let line = r#"{"type":"WAT","data":"{}"}"#;
        match Message::decode_line(line) {
            Err(ShareError::UnknownType(t)) => assert_eq!(t, "WAT"),
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn malformed_outer_json_is_an_error() {
        assert!(matches!(
            Message::decode_line("not json at all"),
            Err(ShareError::MalformedFrame(_))
        ));
    }

    #[test]
    fn malformed_inner_payload_is_an_error() {
        let line = r#"{"type":"PING","data":"{\"timestamp\":"}"#;
        assert!(matches!(
            Message::decode_line(line),
            Err(ShareError::PayloadDecodeFailed { .. })
        ));
    }

    #[test]
    fn list_files_encodes_an_empty_object() {
        let line = Message::ListFiles.encode_line();
        let outer: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(outer["data"], "{}");
        assert!(matches!(
            Message::decode_line(&line).unwrap(),
            Message::ListFiles
        ));
    }

    #[test]
    fn transfer_error_transfer_id_is_optional() {
        let msg = Message::TransferError(TransferError {
            transfer_id: None,
            error_code: "INVALID_REQUEST".into(),
            message: "nope".into(),
        });
        let line = msg.encode_line();
        let outer: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert!(!outer["data"].as_str().unwrap().contains("transferId"));

        let with_id = r#"{"type":"TRANSFER_ERROR","data":"{\"transferId\":\"t\",\"errorCode\":\"FILE_NOT_FOUND\",\"message\":\"m\"}"}"#;
        match Message::decode_line(with_id).unwrap() {
            Message::TransferError(e) => {
                assert_eq!(e.transfer_id.as_deref(), Some("t"));
                assert_eq!(e.error_code, "FILE_NOT_FOUND");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn checksum_is_optional_and_omitted_when_absent() {
        let msg = Message::TransferComplete(TransferComplete {
            transfer_id: "t".into(),
            file_id: "f".into(),
            checksum: None,
        });
        let line = msg.encode_line();
        let outer: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert!(!outer["data"].as_str().unwrap().contains("checksum"));
        match Message::decode_line(&line).unwrap() {
            Message::TransferComplete(c) => assert!(c.checksum.is_none()),
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
