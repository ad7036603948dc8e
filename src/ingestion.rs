//! HTTP side of the engine: one task per connection episode, streaming the
//! response body into the decode thread.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::decoder::worker::DecodeInput;
use crate::error::{Result, StreamError};
use crate::events::{EngineMsg, EngineTx, IngestionEvent};
use crate::utils::resolve_stream_url;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens a streaming byte source for a URL.
pub trait StreamTransport: Send + Sync {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ByteStream>>;
}

/// reqwest transport. Playlist URLs are resolved before every attempt so a
/// station that rotates its relay hosts is followed on reconnect.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        // No overall request timeout: the body is endless. Silence is caught
        // by the ingestion idle timeout instead.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

impl StreamTransport for HttpTransport {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(async move {
            let url = resolve_stream_url(&self.client, url).await?;
            debug!("Fetching stream from URL: {}", url);

            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(StreamError::connection(format!("HTTP error: {}", response.status())));
            }
            let stream = response.bytes_stream().map(|chunk| chunk.map_err(StreamError::from));
            Ok(stream.boxed())
        })
    }
}

pub(crate) struct StreamIngestionClient {
    url: String,
    transport: Arc<dyn StreamTransport>,
    input: DecodeInput,
    events: EngineTx,
    idle_timeout: Duration,
    active: Option<(u64, CancellationToken)>,
}

impl StreamIngestionClient {
    pub(crate) fn new(
        url: String,
        transport: Arc<dyn StreamTransport>,
        input: DecodeInput,
        events: EngineTx,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            url,
            transport,
            input,
            events,
            idle_timeout,
            active: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Open the stream for `session`. Failures, including immediate ones,
    /// arrive later as a single `Disconnected` event.
    pub(crate) fn connect(&mut self, session: u64) {
        self.disconnect();
        let token = CancellationToken::new();
        self.active = Some((session, token.clone()));

        let episode = Episode {
            session,
            url: self.url.clone(),
            transport: self.transport.clone(),
            input: self.input.clone(),
            events: self.events.clone(),
            idle_timeout: self.idle_timeout,
            token,
        };
        tokio::spawn(episode.run());
    }

    /// Idempotent. No event is emitted for a cancelled episode.
    pub(crate) fn disconnect(&mut self) {
        if let Some((session, token)) = self.active.take() {
            debug!("Disconnecting stream session {session}");
            token.cancel();
        }
    }
}

impl Drop for StreamIngestionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Episode {
    session: u64,
    url: String,
    transport: Arc<dyn StreamTransport>,
    input: DecodeInput,
    events: EngineTx,
    idle_timeout: Duration,
    token: CancellationToken,
}

impl Episode {
    async fn run(self) {
        let opened = tokio::select! {
            _ = self.token.cancelled() => return,
            opened = self.transport.open(&self.url) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.finish(e),
        };
        if self.token.is_cancelled() {
            return;
        }
        info!("Connected to {} (session {})", self.url, self.session);
        self.emit(IngestionEvent::Connected);

        let mut total_bytes = 0usize;
        let reason = loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("Network fetch cancelled after {}KB", total_bytes / 1024);
                    return;
                }
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    break StreamError::connection(format!("no data for {:?}", self.idle_timeout))
                }
                Ok(None) => break StreamError::connection("server closed the stream"),
                Ok(Some(Err(e))) => break e,
                Ok(Some(Ok(chunk))) => {
                    let before = total_bytes;
                    total_bytes += chunk.len();
                    if before / (512 * 1024) != total_bytes / (512 * 1024) {
                        debug!("Network fetched {} KB so far", total_bytes / 1024);
                    }
                    if !self.input.push(self.session, chunk) {
                        debug!("Decode thread gone, ending session {}", self.session);
                        return;
                    }
                }
            }
        };
        self.finish(reason);
    }

    fn finish(&self, reason: StreamError) {
        if self.token.is_cancelled() {
            return;
        }
        warn!("Stream session {} ended: {}", self.session, reason);
        self.emit(IngestionEvent::Disconnected(reason));
    }

    fn emit(&self, event: IngestionEvent) {
        let _ = self.events.send(EngineMsg::Ingestion {
            session: self.session,
            event,
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::decoder::testing::SilenceCodec;
    use crate::decoder::worker::DecodeWorker;
    use crate::decoder::FrameDecoder;
    use crate::queue::BoundedSampleQueue;
    use tokio::sync::{mpsc, oneshot, watch};

    fn harness(
        transport: Arc<ScriptedTransport>,
    ) -> (StreamIngestionClient, DecodeWorker, mpsc::UnboundedReceiver<EngineMsg>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tap, _) = watch::channel(None);
        let queue = Arc::new(BoundedSampleQueue::new(4, 1));
        let decoder = FrameDecoder::new(Box::new(SilenceCodec::default()), 0);
        let worker = DecodeWorker::spawn(decoder, queue, events_tx.clone(), tap).unwrap();
        let client = StreamIngestionClient::new(
            "http://example.com/live".into(),
            transport,
            worker.input(),
            events_tx,
            Duration::from_millis(200),
        );
        (client, worker, events_rx)
    }

    async fn next_ingestion(rx: &mut mpsc::UnboundedReceiver<EngineMsg>) -> (u64, IngestionEvent) {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for ingestion event")
                .expect("channel closed");
            if let EngineMsg::Ingestion { session, event } = msg {
                return (session, event);
            }
        }
    }

    #[tokio::test]
    async fn test_refused_connect_reports_once() {
        let transport = ScriptedTransport::new(vec![Attempt::Refuse(StreamError::connection("dns"))]);
        let (mut client, _worker, mut rx) = harness(transport);
        client.connect(7);
        let (session, event) = next_ingestion(&mut rx).await;
        assert_eq!(session, 7);
        assert_eq!(event, IngestionEvent::Disconnected(StreamError::connection("dns")));
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_connected_then_closed() {
        let transport = ScriptedTransport::new(vec![Attempt::Accept(vec![Step::Chunk(
            Bytes::from_static(b"abc"),
        )])]);
        let (mut client, _worker, mut rx) = harness(transport);
        client.connect(1);
        assert_eq!(next_ingestion(&mut rx).await, (1, IngestionEvent::Connected));
        let (_, event) = next_ingestion(&mut rx).await;
        assert!(matches!(event, IngestionEvent::Disconnected(StreamError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_idle_stream_times_out() {
        let transport = ScriptedTransport::new(vec![Attempt::Accept(vec![Step::Hang])]);
        let (mut client, _worker, mut rx) = harness(transport);
        client.connect(1);
        assert_eq!(next_ingestion(&mut rx).await, (1, IngestionEvent::Connected));
        let (_, event) = next_ingestion(&mut rx).await;
        assert!(matches!(event, IngestionEvent::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_suppresses_events() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let transport = ScriptedTransport::new(vec![Attempt::Accept(vec![
            Step::Gate(gate_rx),
            Step::Fail(StreamError::connection("reset")),
        ])]);
        let (mut client, _worker, mut rx) = harness(transport);
        client.connect(1);
        assert_eq!(next_ingestion(&mut rx).await, (1, IngestionEvent::Connected));

        client.disconnect();
        client.disconnect();
        assert!(!client.is_active());
        let _ = gate_tx.send(());
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    }
}
