/// Line-delimited TCP channels of a running agent.
///
/// The activity port accepts any number of producers; each line is one inbound
/// message. The heartbeat port fans every heartbeat out to all connected
/// subscribers as one JSON line.
use crate::messages::{Heartbeat, InboundMessage, MessageError};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Written back for every inbound message once it is queued for the agent.
const ACK_LINE: &str = "OK\n";

pub async fn bind(host: &str, port: u16) -> Result<TcpListener, TransportError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| TransportError::Bind {
            addr: format!("{host}:{port}"),
            source: e,
        })
}

/// Accept producers forever, forwarding every parsed message to `tx`.
pub async fn serve_activity(listener: TcpListener, tx: mpsc::UnboundedSender<InboundMessage>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "activity producer connected");
                tokio::spawn(read_messages(stream, peer, tx.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "activity accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
        if tx.is_closed() {
            return;
        }
    }
}

async fn read_messages(
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<InboundMessage>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match InboundMessage::parse(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            return;
                        }
                        // Queued before acked: a producer that waits for the ack
                        // cannot have its next message overtake this one.
                        if let Err(e) = writer.write_all(ACK_LINE.as_bytes()).await {
                            tracing::debug!(%peer, error = %e, "activity ack not delivered");
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "dropping malformed message"),
                }
            }
            Ok(None) => {
                tracing::debug!(%peer, "activity producer disconnected");
                return;
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "activity read failed");
                return;
            }
        }
    }
}

/// Accept heartbeat subscribers forever; each gets every heartbeat sent on `beats`.
pub async fn serve_heartbeats(listener: TcpListener, beats: broadcast::Sender<Heartbeat>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "heartbeat subscriber connected");
                tokio::spawn(write_heartbeats(stream, peer, beats.subscribe()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn write_heartbeats(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Heartbeat>,
) {
    loop {
        let beat = match rx.recv().await {
            Ok(beat) => beat,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%peer, skipped, "heartbeat subscriber lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let mut line = match serde_json::to_string(&beat) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode heartbeat");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            tracing::debug!(%peer, error = %e, "heartbeat subscriber gone");
            return;
        }
    }
}

/// Deliver one message to an agent's activity port and wait until the agent
/// has queued it.
pub async fn send_message(
    host: &str,
    port: u16,
    message: &InboundMessage,
) -> Result<(), TransportError> {
    let addr = format!("{host}:{port}");
    let mut line = message.encode().map_err(TransportError::Message)?;
    line.push('\n');

    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| TransportError::Connect {
            addr: addr.clone(),
            source: e,
        })?;
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(TransportError::Io)?;
    stream.shutdown().await.map_err(TransportError::Io)?;

    let mut ack = String::new();
    BufReader::new(stream)
        .read_line(&mut ack)
        .await
        .map_err(TransportError::Io)?;
    if ack != ACK_LINE {
        return Err(TransportError::Unacknowledged { addr });
    }
    Ok(())
}

/// Subscribe to an agent's heartbeat port, calling `on_beat` for each heartbeat
/// until the agent closes the connection.
pub async fn follow_heartbeats<F>(host: &str, port: u16, mut on_beat: F) -> Result<(), TransportError>
where
    F: FnMut(Heartbeat),
{
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| TransportError::Connect {
            addr: format!("{host}:{port}"),
            source: e,
        })?;
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await.map_err(TransportError::Io)? {
        match serde_json::from_str::<Heartbeat>(&line) {
            Ok(beat) => on_beat(beat),
            Err(e) => tracing::warn!(error = %e, "ignoring undecodable heartbeat"),
        }
    }
    Ok(())
}

/// Errors from the agent's TCP channels.
#[derive(Debug)]
pub enum TransportError {
    Bind {
        addr: String,
        source: std::io::Error,
    },
    Connect {
        addr: String,
        source: std::io::Error,
    },
    Io(std::io::Error),
    Message(MessageError),
    /// The agent closed the connection without queueing the message.
    Unacknowledged {
        addr: String,
    },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            TransportError::Connect { addr, source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::Message(e) => write!(f, "{e}"),
            TransportError::Unacknowledged { addr } => {
                write!(f, "{addr} closed the connection without acknowledging")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Bind { source, .. } => Some(source),
            TransportError::Connect { source, .. } => Some(source),
            TransportError::Io(e) => Some(e),
            TransportError::Message(e) => Some(e),
            TransportError::Unacknowledged { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DagSeed, StatusReport};
    use std::time::Duration;

    #[tokio::test]
    async fn test_activity_messages_are_forwarded() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_activity(listener, tx));

        let dag = InboundMessage::Dag(DagSeed {
            campaign_id: "c1".into(),
            all_activity_ids: vec!["A".into()],
        });
        send_message("127.0.0.1", port, &dag).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, dag);

        let report = InboundMessage::Report(StatusReport::new("A", "DONE"));
        send_message("127.0.0.1", port, &report).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        send_message("127.0.0.1", port, &InboundMessage::Kill)
            .await
            .unwrap();
        let third = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, report);
        assert_eq!(third, InboundMessage::Kill);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_sends_keep_their_order() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_activity(listener, tx));

        for round in 0..200 {
            let dag = InboundMessage::Dag(DagSeed {
                campaign_id: format!("c{round}"),
                all_activity_ids: vec!["A".into()],
            });
            let report = InboundMessage::Report(StatusReport::new("A", "DONE"));
            send_message("127.0.0.1", port, &dag).await.unwrap();
            send_message("127.0.0.1", port, &report).await.unwrap();

            let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(first, dag, "round {round}");
            assert_eq!(second, report, "round {round}");
        }
    }

    #[tokio::test]
    async fn test_send_without_ack_is_an_error() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let err = send_message("127.0.0.1", port, &InboundMessage::Kill)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unacknowledged { .. }));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_dropped() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_activity(listener, tx));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"not json\n\n{\"activity_id\":\"A\",\"status\":\"DONE\"}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, InboundMessage::Report(StatusReport::new("A", "DONE")));
    }

    #[tokio::test]
    async fn test_heartbeats_reach_subscriber() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (beats, _) = broadcast::channel(16);
        tokio::spawn(serve_heartbeats(listener, beats.clone()));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let follower = tokio::spawn(async move {
            follow_heartbeats("127.0.0.1", port, |beat| {
                let _ = seen_tx.send(beat);
            })
            .await
        });

        // The subscription is registered asynchronously; keep publishing until it lands.
        let beat = Heartbeat::new("c1", "alive");
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let _ = beats.send(beat.clone());
                tokio::select! {
                    got = seen_rx.recv() => return got,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(received, beat);
        follower.abort();
    }

    #[tokio::test]
    async fn test_send_to_closed_port_is_connect_error() {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = send_message("127.0.0.1", port, &InboundMessage::Kill)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_bind_busy_port_fails() {
        let held = bind("127.0.0.1", 0).await.unwrap();
        let port = held.local_addr().unwrap().port();

        let err = bind("127.0.0.1", port).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }
}
