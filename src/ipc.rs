//! Single-subscriber, message-framed, bidirectional local channel. Replays all unsent
//! groups on client (re)connection and streams new/updated groups thereafter. Frames are
//! newline-terminated UTF-8 JSON objects.
//!
//! The accept loop owns the live connection exclusively; all outbound sends funnel
//! through one writer task reading from `outbound_rx`, which serialises writes for free
//! (a single task can't interleave two messages) rather than via an explicit per-message
//! lock.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use interprocess::local_socket::{GenericFilePath, ToFsName};
#[cfg(windows)]
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use interprocess::local_socket::{
    tokio::{prelude::*, Stream as LocalStream},
    ListenerOptions,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::aggregator::{Aggregator, DuplicateGroup};
use crate::content_index::FileRecord;

/// Normal `DUPLICATE_DETECTED` alerts are capped at this many bytes; `SCAN_COMPLETE`
/// (and any other) frame may use up to the larger cap. These are the literal byte counts
/// from the original prototype's `MAX_MESSAGE_SIZE`/`PIPE_BUFFER_SIZE` constants.
pub const MAX_ALERT_FRAME_BYTES: usize = 32 * 1024;
pub const MAX_SCAN_COMPLETE_FRAME_BYTES: usize = 64 * 1024;

pub const DEFAULT_ENDPOINT_NAME: &str = "ddas_ipc";

#[derive(Debug)]
pub enum IpcError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::Io(e) => write!(f, "ipc: {e}"),
            IpcError::Json(e) => write!(f, "ipc: {e}"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::Io(e) => Some(e),
            IpcError::Json(e) => Some(e),
        }
    }
}

impl From<io::Error> for IpcError {
    fn from(e: io::Error) -> Self {
        IpcError::Io(e)
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(e: serde_json::Error) -> Self {
        IpcError::Json(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireFileRecord {
    pub filepath: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filehash: Option<String>,
    pub filesize: u64,
    pub last_mod: String,
    pub file_index: u64,
}

fn to_wire(record: &FileRecord, include_hash: bool) -> WireFileRecord {
    WireFileRecord {
        filepath: record.path.to_string_lossy().into_owned(),
        filename: record.filename.clone(),
        filehash: include_hash.then(|| record.digest.clone()),
        filesize: record.size,
        last_mod: record.last_modified.clone(),
        file_index: record.file_id,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateDetectedAlert {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event: &'static str,
    pub trigger_file: WireFileRecord,
    pub duplicates: Vec<WireFileRecord>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanCompleteAlert {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event: &'static str,
    pub total_files: usize,
    pub duplicate_groups: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorAlert {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub event: &'static str,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    DuplicateDetected(DuplicateDetectedAlert),
    ScanComplete(ScanCompleteAlert),
    Error(ErrorAlert),
}

impl OutboundMessage {
    fn to_frame(&self) -> Result<String, IpcError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Builds the `DUPLICATE_DETECTED` message for a group; `trigger_file` is the first
/// record in the group's list, `duplicates` the remainder (per spec: the group's current
/// full contents are always sent, never a delta).
pub fn duplicate_detected_message(group: &DuplicateGroup) -> OutboundMessage {
    let (trigger, rest) = group
        .records
        .split_first()
        .expect("duplicate_detected_message called on a group with < 1 record");
    OutboundMessage::DuplicateDetected(DuplicateDetectedAlert {
        msg_type: "ALERT",
        event: "DUPLICATE_DETECTED",
        trigger_file: to_wire(trigger, true),
        duplicates: rest.iter().map(|r| to_wire(r, false)).collect(),
        timestamp: group.last_updated.clone(),
    })
}

pub fn scan_complete_message(total_files: usize, duplicate_groups: usize, timestamp: String) -> OutboundMessage {
    OutboundMessage::ScanComplete(ScanCompleteAlert {
        msg_type: "ALERT",
        event: "SCAN_COMPLETE",
        total_files,
        duplicate_groups,
        timestamp,
    })
}

pub fn error_message(message: String, timestamp: String) -> OutboundMessage {
    OutboundMessage::Error(ErrorAlert {
        msg_type: "ALERT",
        event: "ERROR",
        message,
        timestamp,
    })
}

/// Handed to the `Aggregator` so it can push alerts without knowing whether a client is
/// actually attached. `send` reports whether the message was actually handed to a
/// connected client (i.e. whether the aggregator may mark the group `delivered`).
#[derive(Clone)]
pub struct OutboundHandle {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

impl OutboundHandle {
    pub fn send(&self, message: OutboundMessage) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        self.sender.send(message).is_ok()
    }
}

/// Creates the outbound channel pair: the handle given to the `Aggregator`, and the
/// receiver + connection flag retained by the server's accept loop.
pub fn channel() -> (OutboundHandle, mpsc::UnboundedReceiver<OutboundMessage>, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    (
        OutboundHandle { sender: tx, connected: connected.clone() },
        rx,
        connected,
    )
}

/// Runs the accept loop until `cancel` fires. Exactly one subscriber at a time;
/// additional connection attempts are queued by the OS listener backlog until the
/// current one drops, matching the donor's single-subscriber model.
pub async fn run_server(
    name: &str,
    aggregator: Arc<Aggregator>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    connected: Arc<AtomicBool>,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<(), IpcError> {
    let listener = bind_listener(name)?;
    log::info!("[IPC] listening on {name}");

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    log::info!("[IPC] shutting down accept loop");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("[ERROR] ipc accept failed: {e}");
                        continue;
                    }
                };
                log::info!("[IPC] client connected");
                serve_client(stream, &aggregator, &mut outbound_rx, &connected, &mut cancel).await;
                connected.store(false, Ordering::Release);
                aggregator.on_client_disconnect();
                log::info!("[IPC] client disconnected");
            }
        }
    }
}

#[cfg(unix)]
fn bind_listener(name: &str) -> Result<interprocess::local_socket::tokio::Listener, IpcError> {
    let path = std::env::temp_dir().join(format!("{name}.sock"));
    let _ = std::fs::remove_file(&path);
    let fs_name = path.to_fs_name::<GenericFilePath>()?;
    Ok(ListenerOptions::new().name(fs_name).create_tokio()?)
}

#[cfg(windows)]
fn bind_listener(name: &str) -> Result<interprocess::local_socket::tokio::Listener, IpcError> {
    let ns_name = format!("{name}.sock").to_ns_name::<GenericNamespaced>()?;
    Ok(ListenerOptions::new().name(ns_name).create_tokio()?)
}

async fn serve_client(
    stream: LocalStream,
    aggregator: &Arc<Aggregator>,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    connected: &Arc<AtomicBool>,
    cancel: &mut tokio::sync::watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    // Mark connected before replaying so an `on_duplicate` landing on the scanner/watcher
    // thread mid-replay queues onto `outbound_rx` instead of being dropped as
    // undeliverable; the per-group `delivered` flag already prevents a group from being
    // both replayed here and re-sent as fresh.
    connected.store(true, Ordering::Release);

    for group in aggregator.replay_snapshot() {
        let message = duplicate_detected_message(&group);
        if let Err(e) = write_frame(&mut write_half, &message).await {
            log::warn!("[ERROR] ipc replay write failed: {e}");
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if let Err(e) = write_frame(&mut write_half, &message).await {
                            log::warn!("[ERROR] ipc send failed: {e}");
                            return;
                        }
                    }
                    None => return,
                }
            }
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => return,
                    Ok(_) => {
                        if let Err(e) = handle_inbound(&line, &mut write_half).await {
                            log::warn!("[ERROR] ipc inbound handling failed: {e}");
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("[ERROR] ipc read failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &OutboundMessage) -> Result<(), IpcError> {
    let frame = message.to_frame()?;
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Any well-formed or malformed JSON line from the client is acknowledged with the
/// generic RESPONSE envelope; command semantics beyond acknowledgement are delegated to
/// the client (§4.8). Never fatal (`ClientProtocolError` in the spec's taxonomy).
async fn handle_inbound<W: AsyncWriteExt + Unpin>(line: &str, writer: &mut W) -> Result<(), IpcError> {
    let _ = serde_json::from_str::<serde_json::Value>(line.trim());
    let ack = serde_json::json!({
        "type": "RESPONSE",
        "status": "OK",
        "message": "Command received",
    });
    let mut frame = ack.to_string();
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_index::FileRecord;

    fn record(path: &str, digest: &str) -> FileRecord {
        FileRecord {
            path: path.into(),
            filename: path.rsplit('/').next().unwrap().to_string(),
            digest: digest.to_string(),
            size: 4,
            last_modified: "2024-01-01T00:00:00.000Z".to_string(),
            file_id: 1,
        }
    }

    #[test]
    fn duplicate_detected_frame_matches_schema() {
        let group = DuplicateGroup {
            digest: "abc".to_string(),
            records: vec![record("/a/one.bin", "abc"), record("/a/two.bin", "abc")],
            last_updated: "2024-01-01T00:00:00.000Z".to_string(),
            delivered: false,
        };
        let message = duplicate_detected_message(&group);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "ALERT");
        assert_eq!(json["event"], "DUPLICATE_DETECTED");
        assert_eq!(json["trigger_file"]["filehash"], "abc");
        assert!(json["duplicates"][0].get("filehash").is_none());
    }

    #[test]
    fn scan_complete_frame_matches_schema() {
        let message = scan_complete_message(10, 2, "2024-01-01T00:00:00.000Z".to_string());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "ALERT");
        assert_eq!(json["event"], "SCAN_COMPLETE");
        assert_eq!(json["total_files"], 10);
        assert_eq!(json["duplicate_groups"], 2);
    }

    #[test]
    fn frame_size_constants_match_original_prototype() {
        assert_eq!(MAX_ALERT_FRAME_BYTES, 32768);
        assert_eq!(MAX_SCAN_COMPLETE_FRAME_BYTES, 65536);
    }

    #[test]
    fn duplicate_detected_frame_is_newline_terminated() {
        let group = DuplicateGroup {
            digest: "abc".to_string(),
            records: vec![record("/a/one.bin", "abc"), record("/a/two.bin", "abc")],
            last_updated: "2024-01-01T00:00:00.000Z".to_string(),
            delivered: false,
        };
        let message = duplicate_detected_message(&group);
        let frame = message.to_frame().unwrap();
        assert!(frame.ends_with('\n'));
        assert!(frame.len() < MAX_ALERT_FRAME_BYTES);
    }
}
