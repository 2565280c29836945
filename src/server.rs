//! Inbound connection server: accept loop plus the per-session request
//! dispatcher.
//!
//! Each accepted socket becomes a [`Session`] served by its own task. A
//! session starts with a `HANDSHAKE`/`HANDSHAKE_ACK` exchange and then
//! loops on envelopes: file listing, transfer serving, ping, and cancel.
//! Anything unrecognised gets a `TRANSFER_ERROR` with `INVALID_REQUEST`
//! and the session keeps serving; a malformed frame or a failure while
//! bulk bytes are on the wire abandons the session instead, since the
//! stream can no longer be re-framed.
//!
//! Concurrency is capped: past the session limit, connections are accepted
//! and immediately dropped without a message.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Identity;
use crate::error::{ErrorCode, ShareError, ShareResult};
use crate::index::SharedIndex;
use crate::protocol::{
    FileList, HandshakeAck, Message, Pong, TransferCancelled, TransferComplete, TransferError,
    TransferRequest, TransferStart, ACCEPT_POLL_SECS, CHUNK_SIZE, MAX_INBOUND_SESSIONS,
};
use crate::session::Session;

/// Serve inbound connections until cancelled. On shutdown every tracked
/// session task is stopped and the listener is released.
pub(crate) async fn run_acceptor(
    listener: TcpListener,
    identity: Identity,
    index: SharedIndex,
    cancel: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(MAX_INBOUND_SESSIONS));
    let mut sessions: JoinSet<()> = JoinSet::new();

    if let Ok(addr) = listener.local_addr() {
        info!("accepting peer connections on {}", addr);
    }

    loop {
        // Reap whatever finished since the last turn.
        while sessions.try_join_next().is_some() {}

        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = timeout(Duration::from_secs(ACCEPT_POLL_SECS), listener.accept()) => {
                let (stream, peer_addr) = match accepted {
                    // Poll window elapsed with nothing inbound.
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                    Ok(Ok(pair)) => pair,
                };

                let permit = match limiter.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("dropping {} (session limit reached)", peer_addr);
                        drop(stream);
                        continue;
                    }
                };

                let session = match Session::from_stream(stream) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to adopt connection from {}: {}", peer_addr, e);
                        continue;
                    }
                };

                debug!("accepted connection from {}", peer_addr);
                let identity = identity.clone();
                let index = index.clone();
                let session_cancel = cancel.child_token();
                sessions.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = serve_session(session, identity, index, session_cancel).await {
                        debug!("session with {} ended: {}", peer_addr, e);
                    }
                });
            }
        }
    }

    sessions.shutdown().await;
    info!("acceptor stopped");
}

/// Handshake, then dispatch envelopes until the peer goes away.
async fn serve_session(
    mut session: Session,
    identity: Identity,
    index: SharedIndex,
    cancel: CancellationToken,
) -> ShareResult<()> {
    let hello = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        msg = session.recv() => msg?,
    };
    let intro = match hello {
        Message::Handshake(h) => h,
        other => {
            return Err(ShareError::UnexpectedMessage {
                expected: "HANDSHAKE",
                got: other.type_tag().to_string(),
            })
        }
    };
    debug!(
        "handshake from {} ({}) at {}",
        intro.nickname,
        intro.device_id,
        session.remote()
    );
    session
        .send(&Message::HandshakeAck(HandshakeAck {
            device_id: identity.device_id.clone(),
            nickname: identity.nickname.clone(),
            status: "accepted".to_string(),
        }))
        .await?;

    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => {
                session.close().await;
                return Ok(());
            }
            msg = session.recv() => msg,
        };

        match inbound {
            Ok(Message::ListFiles) => {
                session
                    .send(&Message::FileList(FileList {
                        files: index.files(),
                    }))
                    .await?;
            }
            Ok(Message::Ping(ping)) => {
                session
                    .send(&Message::Pong(Pong {
                        timestamp: ping.timestamp,
                    }))
                    .await?;
            }
            Ok(Message::TransferRequest(request)) => {
                send_file(&mut session, &index, request).await?;
            }
            Ok(Message::CancelTransfer(cancel_msg)) => {
                // Nothing is in flight on this session, acknowledge anyway.
                session
                    .send(&Message::TransferCancelled(TransferCancelled {
                        transfer_id: cancel_msg.transfer_id,
                    }))
                    .await?;
            }
            // Post-transfer acknowledgement and sender-side progress are
            // tolerated chatter.
            Ok(Message::TransferAck(_)) | Ok(Message::TransferProgress(_)) => {}
            Ok(other) => {
                reply_invalid(
                    &mut session,
                    format!("unexpected message {}", other.type_tag()),
                )
                .await?;
            }
            Err(ShareError::UnknownType(kind)) => {
                reply_invalid(&mut session, format!("unknown message type {}", kind)).await?;
            }
            Err(ShareError::PayloadDecodeFailed { kind, .. }) => {
                reply_invalid(&mut session, format!("undecodable {} payload", kind)).await?;
            }
            Err(ShareError::PeerClosed) => {
                session.close().await;
                return Ok(());
            }
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        }
    }
}

async fn reply_invalid(session: &mut Session, message: String) -> ShareResult<()> {
    warn!("{} from {}", message, session.remote());
    session
        .send(&Message::TransferError(TransferError {
            transfer_id: None,
            error_code: ErrorCode::InvalidRequest.as_str().to_string(),
            message,
        }))
        .await
}

/// Serve one `TRANSFER_REQUEST`: announce, stream the bytes, confirm. A
/// `CANCEL_TRANSFER` for the same transfer arriving mid-stream stops the
/// send and is acknowledged in-band.
async fn send_file(
    session: &mut Session,
    index: &SharedIndex,
    request: TransferRequest,
) -> ShareResult<()> {
    let entry = match index.resolve(&request.file_id) {
        Some(entry) => entry,
        None => {
            session
                .send(&Message::TransferError(TransferError {
                    transfer_id: Some(request.transfer_id),
                    error_code: ErrorCode::FileNotFound.as_str().to_string(),
                    message: format!("no shared file with id {}", request.file_id),
                }))
                .await?;
            return Ok(());
        }
    };

    let mut file = match tokio::fs::File::open(&entry.abs_path).await {
        Ok(f) => f,
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                _ => ErrorCode::IoError,
            };
            session
                .send(&Message::TransferError(TransferError {
                    transfer_id: Some(request.transfer_id),
                    error_code: code.as_str().to_string(),
                    message: format!("cannot open {}: {}", entry.file.relative_path, e),
                }))
                .await?;
            return Ok(());
        }
    };

    let file_size = file.metadata().await?.len();
    info!(
        "sending {} ({} bytes) to {}",
        entry.file.relative_path,
        file_size,
        session.remote()
    );
    session
        .send(&Message::TransferStart(TransferStart {
            transfer_id: request.transfer_id.clone(),
            file_id: request.file_id.clone(),
            file_name: entry.file.name.clone(),
            file_size,
            chunk_size: CHUNK_SIZE,
        }))
        .await?;

    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let mut remaining = file_size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;

        tokio::select! {
            biased;

            inbound = session.rx.recv() => {
                match inbound {
                    Ok(Message::CancelTransfer(c)) if c.transfer_id == request.transfer_id => {
                        info!("transfer {} cancelled by peer mid-stream", request.transfer_id);
                        session.tx
                            .send(&Message::TransferCancelled(TransferCancelled {
                                transfer_id: request.transfer_id,
                            }))
                            .await?;
                        return Ok(());
                    }
                    Ok(_) => {}
                    // Reader gone while bulk bytes are outstanding: the
                    // session is unusable.
                    Err(e) => return Err(e),
                }
            }

            read = file.read(&mut buf[..want]) => {
                let n = read?;
                if n == 0 {
                    return Err(ShareError::ConnectionLost(format!(
                        "{} shrank during send",
                        entry.file.relative_path
                    )));
                }
                session.tx.send_bytes(&buf[..n]).await?;
                remaining -= n as u64;
            }
        }
    }

    session
        .send(&Message::TransferComplete(TransferComplete {
            transfer_id: request.transfer_id,
            file_id: request.file_id,
            checksum: None,
        }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::file_id_for;
    use crate::protocol::{Ping, TransferAck};
    use crate::session::client_handshake;
    use std::net::SocketAddr;
    use std::path::Path;

    fn test_identity() -> Identity {
        Identity {
            device_id: "server-dev".into(),
            nickname: "server".into(),
        }
    }

    async fn start_server(root: &Path) -> (SocketAddr, CancellationToken) {
        let index = SharedIndex::new(root).unwrap();
        index.rescan().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(run_acceptor(
            listener,
            test_identity(),
            index,
            cancel.clone(),
        ));
        (addr, cancel)
    }

    async fn connect_and_handshake(addr: SocketAddr) -> Session {
        let mut session = Session::connect(&addr.to_string()).await.unwrap();
        let identity = Identity {
            device_id: "client-dev".into(),
            nickname: "client".into(),
        };
        let ack = client_handshake(&mut session, &identity).await.unwrap();
        assert_eq!(ack.status, "accepted");
        session
    }

    async fn read_exact_bulk(session: &mut Session, len: usize) -> Vec<u8> {
        let mut got = Vec::with_capacity(len);
        let mut buf = vec![0u8; 8192];
        while got.len() < len {
            let want = (len - got.len()).min(buf.len());
            let n = session.recv_bytes(&mut buf[..want]).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        got
    }

    #[tokio::test]
    async fn lists_files_and_serves_a_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi\n").unwrap();
        let (addr, cancel) = start_server(dir.path()).await;

        let mut session = connect_and_handshake(addr).await;

        session.send(&Message::ListFiles).await.unwrap();
        let files = match session.recv().await.unwrap() {
            Message::FileList(list) => list.files,
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "hello.txt");

        session
            .send(&Message::TransferRequest(TransferRequest {
                file_id: files[0].file_id.clone(),
                transfer_id: "t-1".into(),
            }))
            .await
            .unwrap();

        let start = match session.recv().await.unwrap() {
            Message::TransferStart(s) => s,
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(start.file_size, 3);
        assert_eq!(start.chunk_size, CHUNK_SIZE);

        let body = read_exact_bulk(&mut session, 3).await;
        assert_eq!(&body, b"hi\n");

        assert!(matches!(
            session.recv().await.unwrap(),
            Message::TransferComplete(_)
        ));
        session
            .send(&Message::TransferAck(TransferAck {
                transfer_id: "t-1".into(),
                status: "completed".into(),
            }))
            .await
            .unwrap();

        // The session keeps serving after a transfer.
        session
            .send(&Message::Ping(Ping { timestamp: 5 }))
            .await
            .unwrap();
        assert!(matches!(session.recv().await.unwrap(), Message::Pong(_)));

        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_type_gets_invalid_request_and_session_survives() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, cancel) = start_server(dir.path()).await;

        let mut session = connect_and_handshake(addr).await;

        session
            .send_bytes(b"{\"type\":\"WAT\",\"data\":\"{}\"}\n")
            .await
            .unwrap();
        match session.recv().await.unwrap() {
            Message::TransferError(e) => {
                assert_eq!(e.error_code, "INVALID_REQUEST");
                assert!(e.transfer_id.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        // Still serving on the same session.
        session.send(&Message::ListFiles).await.unwrap();
        assert!(matches!(
            session.recv().await.unwrap(),
            Message::FileList(_)
        ));

        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_file_yields_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, cancel) = start_server(dir.path()).await;

        let mut session = connect_and_handshake(addr).await;
        session
            .send(&Message::TransferRequest(TransferRequest {
                file_id: file_id_for("nope.txt"),
                transfer_id: "t-2".into(),
            }))
            .await
            .unwrap();

        match session.recv().await.unwrap() {
            Message::TransferError(e) => {
                assert_eq!(e.error_code, "FILE_NOT_FOUND");
                assert_eq!(e.transfer_id.as_deref(), Some("t-2"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_without_inflight_transfer_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, cancel) = start_server(dir.path()).await;

        let mut session = connect_and_handshake(addr).await;
        session
            .send(&Message::CancelTransfer(crate::protocol::CancelTransfer {
                transfer_id: "t-9".into(),
            }))
            .await
            .unwrap();
        match session.recv().await.unwrap() {
            Message::TransferCancelled(c) => assert_eq!(c.transfer_id, "t-9"),
            other => panic!("unexpected reply: {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn session_without_handshake_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, cancel) = start_server(dir.path()).await;

        let mut session = Session::connect(&addr.to_string()).await.unwrap();
        session
            .send(&Message::Ping(Ping { timestamp: 1 }))
            .await
            .unwrap();
        assert!(session.recv().await.is_err());

        cancel.cancel();
    }
}
