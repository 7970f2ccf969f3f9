//! Process-manager integration: readiness notification and control
//! messages.

use std::path::Path;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

/// A control instruction delivered by the supervising process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Shutdown,
}

impl ControlMessage {
    /// Parse one line. Unknown messages yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Tell the supervisor the process is ready to serve.
///
/// Sends `READY=1` to the datagram socket named by `$NOTIFY_SOCKET`. Never
/// fails the caller: a missing socket is normal, a send failure is logged.
pub async fn notify_ready() {
    let Some(socket) = std::env::var_os("NOTIFY_SOCKET") else {
        tracing::debug!("NOTIFY_SOCKET not set, skipping readiness notification");
        return;
    };
    match send_notify(Path::new(&socket), "READY=1").await {
        Ok(()) => tracing::info!("Readiness reported to supervisor"),
        Err(e) => tracing::warn!(
            socket = %Path::new(&socket).display(),
            error = %e,
            "Failed to notify supervisor"
        ),
    }
}

#[cfg(unix)]
async fn send_notify(socket: &Path, message: &str) -> std::io::Result<()> {
    let sock = tokio::net::UnixDatagram::unbound()?;
    sock.send_to(message.as_bytes(), socket).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn send_notify(_socket: &Path, _message: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "readiness notification requires unix sockets",
    ))
}

/// Read line-delimited control messages from stdin.
pub fn control_messages() -> mpsc::UnboundedReceiver<ControlMessage> {
    spawn_control_reader(BufReader::new(tokio::io::stdin()))
}

fn spawn_control_reader<R>(reader: R) -> mpsc::UnboundedReceiver<ControlMessage>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = LinesStream::new(reader.lines());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read control channel");
                    return;
                }
            };
            match ControlMessage::parse(&line) {
                Some(message) => {
                    tracing::info!(?message, "Control message received");
                    if tx.send(message).is_err() {
                        return;
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::debug!(line = %line.trim(), "Ignoring unknown control message"),
            }
        }
        tracing::debug!("Control channel closed");
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_messages() {
        assert_eq!(ControlMessage::parse("shutdown\n"), Some(ControlMessage::Shutdown));
        assert_eq!(ControlMessage::parse("  shutdown "), Some(ControlMessage::Shutdown));
        assert_eq!(ControlMessage::parse("reload"), None);
    }

    #[tokio::test]
    async fn reader_forwards_known_messages() {
        let input: &[u8] = b"hello\n\nshutdown\nshutdown\n";
        let mut rx = spawn_control_reader(BufReader::new(input));
        assert_eq!(rx.recv().await, Some(ControlMessage::Shutdown));
        assert_eq!(rx.recv().await, Some(ControlMessage::Shutdown));
        assert_eq!(rx.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn notify_sends_ready_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let server = tokio::net::UnixDatagram::bind(&path).unwrap();

        send_notify(&path, "READY=1").await.unwrap();

        let mut buf = [0u8; 32];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn notify_to_missing_socket_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(send_notify(&dir.path().join("absent.sock"), "READY=1").await.is_err());
    }
}
