//! One peer connection wrapped as a [`Session`].
//!
//! A session owns a reliable ordered byte stream and speaks two alternating
//! modes on it: newline-delimited envelope messages, and raw bulk bytes
//! during a file transfer. The read and write halves are held as separate
//! structs so a serve loop can wait on inbound envelopes while pushing bulk
//! chunks out of the other half.
//!
//! Every await is bounded by the inactivity deadline; the deadline resets on
//! each successful read or write. `TCP_NODELAY` and keep-alive are applied
//! when the stream is adopted.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::Identity;
use crate::error::{ShareError, ShareResult};
use crate::protocol::{
    Handshake, HandshakeAck, Message, CONNECT_TIMEOUT_SECS, IDLE_TIMEOUT_SECS, MAX_FRAME_LEN,
    PROTOCOL_VERSION,
};

pub struct Session {
    pub(crate) rx: SessionReader,
    pub(crate) tx: SessionWriter,
    remote: SocketAddr,
}

pub struct SessionReader {
    reader: BufReader<OwnedReadHalf>,
    /// Partial line carried across cancelled reads so no bytes are lost
    /// when a `recv` future is dropped mid-frame.
    acc: Vec<u8>,
    idle: Duration,
}

pub struct SessionWriter {
    writer: OwnedWriteHalf,
    idle: Duration,
    open: bool,
}

impl Session {
    /// Open an outbound connection. Connect failures and timeouts are
    /// reported as `ConnectionLost` so the caller's retry policy applies.
    pub async fn connect(addr: &str) -> ShareResult<Session> {
        let stream = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| ShareError::ConnectionLost(format!("connect to {} timed out", addr)))?
        .map_err(|e| ShareError::ConnectionLost(format!("connect to {} failed: {}", addr, e)))?;

        Session::from_stream(stream)
    }

    /// Adopt an accepted (or freshly connected) stream.
    pub fn from_stream(stream: TcpStream) -> ShareResult<Session> {
        let remote = stream.peer_addr()?;
        configure_socket(&stream)?;

        let idle = Duration::from_secs(IDLE_TIMEOUT_SECS);
        let (read_half, write_half) = stream.into_split();

        Ok(Session {
            rx: SessionReader {
                reader: BufReader::new(read_half),
                acc: Vec::new(),
                idle,
            },
            tx: SessionWriter {
                writer: write_half,
                idle,
                open: true,
            },
            remote,
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        self.tx.open
    }

    pub async fn send(&mut self, msg: &Message) -> ShareResult<()> {
        self.tx.send(msg).await
    }

    pub async fn recv(&mut self) -> ShareResult<Message> {
        self.rx.recv().await
    }

    pub async fn send_bytes(&mut self, buf: &[u8]) -> ShareResult<()> {
        self.tx.send_bytes(buf).await
    }

    /// Read up to `buf.len()` bulk bytes. Only valid while more bulk bytes
    /// are expected, so EOF here is a lost connection, not an orderly close.
    pub async fn recv_bytes(&mut self, buf: &mut [u8]) -> ShareResult<usize> {
        self.rx.recv_bytes(buf).await
    }

    /// Flush buffered writes and shut the stream down. Safe to call twice.
    pub async fn close(&mut self) {
        self.tx.close().await;
    }
}

impl SessionReader {
    /// Receive the next envelope message. Blocks until a full line, orderly
    /// EOF (`PeerClosed`), or the inactivity deadline.
    pub async fn recv(&mut self) -> ShareResult<Message> {
        loop {
            let (consumed, complete) = {
                let available = timeout(self.idle, self.reader.fill_buf())
                    .await
                    .map_err(|_| ShareError::ConnectionLost("inactivity timeout".into()))??;

                if available.is_empty() {
                    if self.acc.is_empty() {
                        return Err(ShareError::PeerClosed);
                    }
                    return Err(ShareError::ConnectionLost(
                        "stream ended mid-frame".into(),
                    ));
                }

                match available.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        self.acc.extend_from_slice(&available[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        self.acc.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);

            if self.acc.len() > MAX_FRAME_LEN {
                self.acc.clear();
                return Err(ShareError::MalformedFrame("frame too large".into()));
            }

            if complete {
                let raw = std::mem::take(&mut self.acc);
                let line = String::from_utf8(raw)
                    .map_err(|_| ShareError::MalformedFrame("frame is not UTF-8".into()))?;
                return Message::decode_line(&line);
            }
        }
    }

    pub async fn recv_bytes(&mut self, buf: &mut [u8]) -> ShareResult<usize> {
        let n = timeout(self.idle, self.reader.read(buf))
            .await
            .map_err(|_| ShareError::ConnectionLost("inactivity timeout".into()))??;
        if n == 0 {
            return Err(ShareError::ConnectionLost("stream ended mid-transfer".into()));
        }
        Ok(n)
    }
}

impl SessionWriter {
    pub async fn send(&mut self, msg: &Message) -> ShareResult<()> {
        self.send_bytes(msg.encode_line().as_bytes()).await
    }

    pub async fn send_bytes(&mut self, buf: &[u8]) -> ShareResult<()> {
        timeout(self.idle, async {
            self.writer.write_all(buf).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| ShareError::ConnectionLost("inactivity timeout".into()))?
        .map_err(|e| ShareError::ConnectionLost(format!("write failed: {}", e)))?;
        Ok(())
    }

    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = self.writer.flush().await;
        let _ = self.writer.shutdown().await;
    }
}

/// Low-latency small frames plus keep-alive so half-dead peers are noticed
/// between messages.
fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Client side of the session handshake: introduce ourselves, wait for the
/// acknowledgement.
pub(crate) async fn client_handshake(
    session: &mut Session,
    identity: &Identity,
) -> ShareResult<HandshakeAck> {
    session
        .send(&Message::Handshake(Handshake {
            device_id: identity.device_id.clone(),
            nickname: identity.nickname.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }))
        .await?;

    match session.recv().await? {
        Message::HandshakeAck(ack) => Ok(ack),
        other => Err(ShareError::UnexpectedMessage {
            expected: "HANDSHAKE_ACK",
            got: other.type_tag().to_string(),
        }),
    }
}

/// Current time as milliseconds since the UNIX epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
