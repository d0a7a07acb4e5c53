//! # Connection — FAH Command Socket
//!
//! A TCP connection split into two halves: [`Connection`] owns the write side
//! and sends commands, [`MessageReader`] owns the read side and yields framed
//! [`Message`]s. The session hands the reader to its read task and keeps the
//! connection for commands.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::message::{Message, MessageFramer, MessageType};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The socket was closed, by either side. Not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionClosed;

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection closed")
    }
}

impl std::error::Error for ConnectionClosed {}

/// True when `err` only says the connection is already gone.
pub fn is_closed_error(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<ConnectionClosed>().is_some() {
        return true;
    }
    err.downcast_ref::<std::io::Error>().is_some_and(|e| {
        matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    })
}

pub struct Connection {
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Open a socket to `host:port`.
    pub async fn open(host: &str, port: u16) -> Result<(Connection, MessageReader)> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("timed out connecting to {}:{}", host, port))?
            .with_context(|| format!("failed to connect to {}:{}", host, port))?;
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        let connected = Arc::new(AtomicBool::new(true));
        Ok((
            Connection {
                writer: Mutex::new(Some(writer)),
                connected: connected.clone(),
            },
            MessageReader {
                lines: BufReader::new(reader),
                framer: MessageFramer::new(),
                connected,
            },
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Write one command line.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionClosed)?;
        debug!(command = %redact(command), "Sending command");
        let line = format!("{}\n", command);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e).context("failed to send command");
        }
        Ok(())
    }

    /// Shut down the write half. The read half sees EOF.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

fn redact(command: &str) -> &str {
    if command.starts_with("auth ") {
        "auth ***"
    } else {
        command
    }
}

pub struct MessageReader {
    lines: BufReader<OwnedReadHalf>,
    framer: MessageFramer,
    connected: Arc<AtomicBool>,
}

impl MessageReader {
    /// Read until the next complete message of a known type. Frames of types
    /// the monitor does not subscribe to are skipped. EOF yields
    /// [`ConnectionClosed`].
    pub async fn next_message(&mut self) -> Result<Message> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = match self.lines.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            };
            if n == 0 {
                self.connected.store(false, Ordering::SeqCst);
                self.framer.reset();
                return Err(ConnectionClosed.into());
            }
            let Some(frame) = self.framer.push_line(line.trim_end_matches('\n')) else {
                continue;
            };
            match MessageType::from_wire(&frame.type_name) {
                Some(message_type) => return Ok(Message::new(message_type, frame.text)),
                None => debug!(r#type = %frame.type_name, "Skipping unsubscribed message"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn closed_errors_are_recognised() {
        assert!(is_closed_error(&anyhow::Error::new(ConnectionClosed)));
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_closed_error(&anyhow::Error::new(reset)));
        assert!(!is_closed_error(&anyhow::anyhow!("malformed body")));
    }

    #[test]
    fn auth_is_redacted() {
        assert_eq!(redact("auth hunter2"), "auth ***");
        assert_eq!(redact("queue-info"), "queue-info");
    }

    #[tokio::test]
    async fn reads_frames_and_sends_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"Welcome to the Folding@home Client command server.\n> PyON 1 bogus\n{}\n---\nPyON 1 heartbeat\n7\n---\n")
                .await
                .unwrap();
            let mut reader = BufReader::new(sock);
            let mut got = String::new();
            reader.read_line(&mut got).await.unwrap();
            got
        });

        let (conn, mut reader) = Connection::open("127.0.0.1", port).await.unwrap();
        let msg = reader.next_message().await.unwrap();
        assert_eq!(msg.message_type(), MessageType::Heartbeat);
        assert_eq!(msg.text, "7");

        conn.send_command("queue-info").await.unwrap();
        assert_eq!(server.await.unwrap(), "queue-info\n");

        let err = reader.next_message().await.unwrap_err();
        assert!(is_closed_error(&err));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn send_after_close_fails_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });
        let (conn, _reader) = Connection::open("127.0.0.1", port).await.unwrap();
        conn.close().await;
        let err = conn.send_command("pause").await.unwrap_err();
        assert!(is_closed_error(&err));
    }
}
