//! TCP transport for a regional endpoint speaking the frame protocol

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_shared::codec::{self, Frame, FrameDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::traits::{CommandTransport, SubscriptionTransport, TransportError};
use crate::command::CommandTemplate;
use crate::subscription::StatusSink;

const READ_CHUNK: usize = 4096;

/// An open status feed for one device
struct Feed {
    id: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

type Feeds = Arc<DashMap<String, Feed>>;

/// Frame-protocol client
///
/// Each `send` and `query_status` uses its own short-lived connection. Each
/// subscribed device holds one long-lived connection whose reader forwards
/// `Status` frames into the status sink. When the endpoint ends a feed, the
/// reader drops its entry and reports the loss through the sink.
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    sink: StatusSink,
    feeds: Feeds,
    next_feed_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, sink: StatusSink) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
            sink,
            feeds: Arc::new(DashMap::new()),
            next_feed_id: AtomicU64::new(1),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of open status feeds
    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::Unreachable(format!("{}: {}", self.address, e))),
            Err(_) => Err(TransportError::Timeout(self.connect_timeout)),
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec::encode(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| TransportError::Unreachable(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::Unreachable(e.to_string()))
}

/// Read until one whole frame is buffered
async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(frame) = decoder
            .decode_next()
            .map_err(|e| TransportError::Protocol(e.to_string()))?
        {
            return Ok(frame);
        }

        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        decoder.extend(&chunk[..n]);
    }
}

/// Forward one feed's status frames until the connection ends
///
/// Starts reading only once `registered` fires, so the feed entry exists
/// before the reader can remove it.
async fn run_feed<R>(
    mut reader: R,
    mut decoder: FrameDecoder,
    device_id: String,
    feed_id: u64,
    feeds: Feeds,
    sink: StatusSink,
    registered: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    if registered.await.is_err() {
        return;
    }

    let reason = loop {
        match read_frame(&mut reader, &mut decoder).await {
            Ok(Frame::Status { device_id: from, payload }) => {
                if !sink.publish(from, payload).await {
                    debug!(device_id = %device_id, "Status sink closed, stopping feed");
                    break None;
                }
            }
            Ok(other) => {
                debug!(device_id = %device_id, "Ignoring frame on status feed: {:?}", other);
            }
            Err(TransportError::Closed) => {
                info!(device_id = %device_id, "Status feed closed by endpoint");
                break Some("status feed closed by endpoint".to_string());
            }
            Err(e) => {
                warn!(device_id = %device_id, "Status feed error: {}", e);
                break Some(e.to_string());
            }
        }
    };

    // A newer feed for the same device may have replaced this one
    let removed = feeds.remove_if(&device_id, |_, feed| feed.id == feed_id).is_some();
    if let (true, Some(reason)) = (removed, reason) {
        sink.feed_lost(device_id, reason).await;
    }
}

#[async_trait]
impl CommandTransport for TcpTransport {
    async fn send(&self, command: &CommandTemplate, endpoint: &str) -> Result<String, TransportError> {
        let mut stream = self.connect().await?;
        let mut decoder = FrameDecoder::new();

        write_frame(
            &mut stream,
            &Frame::Send {
                request: command.to_request(),
                endpoint: endpoint.to_string(),
            },
        )
        .await?;

        // Status pushes may interleave; skip them until the reply
        loop {
            match read_frame(&mut stream, &mut decoder).await? {
                Frame::Accepted { command_id } => return Ok(command_id),
                Frame::Rejected { reason } => return Err(TransportError::Rejected(reason)),
                Frame::Status { .. } => continue,
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply to send: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn query_status(
        &self,
        device_id: &str,
        endpoint: &str,
    ) -> Result<serde_json::Value, TransportError> {
        let mut stream = self.connect().await?;
        let mut decoder = FrameDecoder::new();

        write_frame(
            &mut stream,
            &Frame::QueryStatus {
                device_id: device_id.to_string(),
                endpoint: endpoint.to_string(),
            },
        )
        .await?;

        loop {
            match read_frame(&mut stream, &mut decoder).await? {
                Frame::Status {
                    device_id: answered,
                    payload,
                } if answered == device_id => return Ok(payload),
                Frame::Status { .. } => continue,
                Frame::Rejected { reason } => return Err(TransportError::Rejected(reason)),
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected reply to status query: {:?}",
                        other
                    )))
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

#[async_trait]
impl SubscriptionTransport for TcpTransport {
    async fn subscribe(&self, device_id: &str) -> Result<(), TransportError> {
        let stream = self.connect().await?;
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new();

        write_frame(
            &mut writer,
            &Frame::Subscribe {
                device_id: device_id.to_string(),
            },
        )
        .await?;

        match read_frame(&mut reader, &mut decoder).await? {
            Frame::Subscribed { device_id: confirmed } if confirmed == device_id => {}
            Frame::Rejected { reason } => return Err(TransportError::Rejected(reason)),
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected reply to subscribe: {:?}",
                    other
                )))
            }
        }

        let feed_id = self.next_feed_id.fetch_add(1, Ordering::Relaxed);
        let (registered_tx, registered_rx) = oneshot::channel();
        let reader_task = tokio::spawn(run_feed(
            reader,
            decoder,
            device_id.to_string(),
            feed_id,
            self.feeds.clone(),
            self.sink.clone(),
            registered_rx,
        ));

        if let Some(previous) = self.feeds.insert(
            device_id.to_string(),
            Feed {
                id: feed_id,
                writer,
                reader: reader_task,
            },
        ) {
            previous.reader.abort();
        }
        let _ = registered_tx.send(());

        Ok(())
    }

    async fn unsubscribe(&self, device_id: &str) -> Result<(), TransportError> {
        let Some((_, mut feed)) = self.feeds.remove(device_id) else {
            return Ok(());
        };

        let outcome = write_frame(
            &mut feed.writer,
            &Frame::Unsubscribe {
                device_id: device_id.to_string(),
            },
        )
        .await;
        feed.reader.abort();
        outcome
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for feed in self.feeds.iter() {
            feed.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{status_channel, StatusMessage, StatusSubscriptionManager};
    use crate::test_support::template;
    use fleet_shared::state_machine::SubscriptionState;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Serves one connection with a fixed handler
    async fn serve_once<F>(handler: F) -> String
    where
        F: FnOnce(Frame) -> Vec<Frame> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let request = read_frame(&mut socket, &mut decoder).await.unwrap();
            for reply in handler(request) {
                write_frame(&mut socket, &reply).await.unwrap();
            }
            // Hold the connection open briefly so readers see every frame
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        address
    }

    #[tokio::test]
    async fn test_send_accepted() {
        let address = serve_once(|frame| match frame {
            Frame::Send { request, endpoint } => {
                assert_eq!(request.device_id, "watermeter_0001");
                assert_eq!(endpoint, "iotda.cn-east-3.myhuaweicloud.com");
                vec![Frame::Accepted {
                    command_id: "cmd-42".into(),
                }]
            }
            other => panic!("unexpected {:?}", other),
        })
        .await;

        let (sink, _pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        let command_id = transport
            .send(&template("watermeter_0001"), "iotda.cn-east-3.myhuaweicloud.com")
            .await
            .unwrap();
        assert_eq!(command_id, "cmd-42");
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let address = serve_once(|_| {
            vec![Frame::Rejected {
                reason: "device offline".into(),
            }]
        })
        .await;

        let (sink, _pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        let err = transport
            .send(&template("watermeter_0001"), "endpoint")
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Rejected("device offline".into()));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (sink, _pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        let err = transport
            .send(&template("watermeter_0001"), "endpoint")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_subscription_forwards_status() {
        let address = serve_once(|frame| match frame {
            Frame::Subscribe { device_id } => vec![
                Frame::Subscribed {
                    device_id: device_id.clone(),
                },
                Frame::Status {
                    device_id,
                    payload: json!({"status": "auto"}),
                },
            ],
            other => panic!("unexpected {:?}", other),
        })
        .await;

        let (sink, mut pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        transport.subscribe("watermeter_0001").await.unwrap();
        assert_eq!(transport.feed_count(), 1);

        match pump.recv().await.unwrap() {
            StatusMessage::Status(event) => {
                assert_eq!(event.device_id, "watermeter_0001");
                assert_eq!(event.status["status"], "auto");
            }
            other => panic!("expected status, got {:?}", other),
        }

        transport.unsubscribe("watermeter_0001").await.ok();
        assert_eq!(transport.feed_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_feed_is_dropped_and_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            if let Frame::Subscribe { device_id } = read_frame(&mut socket, &mut decoder).await.unwrap() {
                write_frame(&mut socket, &Frame::Subscribed { device_id })
                    .await
                    .unwrap();
            }
            // Endpoint goes away right after confirming
        });

        let (sink, mut pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        transport.subscribe("watermeter_0001").await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), pump.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            message,
            StatusMessage::FeedLost { ref device_id, .. } if device_id == "watermeter_0001"
        ));
        assert_eq!(transport.feed_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_feed_resubscribes_through_manager() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let connections = Arc::new(AtomicU64::new(0));
        let accepted = connections.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let n = accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut decoder = FrameDecoder::new();
                    if let Ok(Frame::Subscribe { device_id }) =
                        read_frame(&mut socket, &mut decoder).await
                    {
                        write_frame(&mut socket, &Frame::Subscribed { device_id })
                            .await
                            .unwrap();
                    }
                    // First feed dies at once, later ones stay up
                    if n > 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                });
            }
        });

        let (sink, pump) = status_channel(4);
        let transport = Arc::new(TcpTransport::new(address, sink));
        let manager = Arc::new(StatusSubscriptionManager::new(
            transport.clone(),
            Duration::from_secs(2),
        ));
        let _pump = pump.start(manager.clone());

        manager.ensure_subscribed("watermeter_0001").await.unwrap();
        for _ in 0..100 {
            if manager.state("watermeter_0001") == SubscriptionState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.state("watermeter_0001"), SubscriptionState::Failed);
        assert_eq!(transport.feed_count(), 0);

        assert_eq!(
            manager.ensure_subscribed("watermeter_0001").await,
            Ok(SubscriptionState::Active)
        );
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert_eq!(transport.feed_count(), 1);
    }

    #[tokio::test]
    async fn test_query_status_answered() {
        let address = serve_once(|frame| match frame {
            Frame::QueryStatus { device_id, endpoint } => {
                assert_eq!(endpoint, "iotda.cn-north-4.myhuaweicloud.com");
                vec![Frame::Status {
                    device_id,
                    payload: json!({"status": "off"}),
                }]
            }
            other => panic!("unexpected {:?}", other),
        })
        .await;

        let (sink, _pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        let payload = transport
            .query_status("watermeter_0001", "iotda.cn-north-4.myhuaweicloud.com")
            .await
            .unwrap();
        assert_eq!(payload, json!({"status": "off"}));
    }

    #[tokio::test]
    async fn test_query_status_rejected() {
        let address = serve_once(|_| {
            vec![Frame::Rejected {
                reason: "no status known for watermeter_0009".into(),
            }]
        })
        .await;

        let (sink, _pump) = status_channel(4);
        let transport = TcpTransport::new(address, sink);
        let err = transport
            .query_status("watermeter_0009", "endpoint")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }
}
