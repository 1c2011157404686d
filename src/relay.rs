//! Outbound SSE stream manager. Pumps upstream bytes to the downstream sink
//! with heartbeat keepalives, backpressure and read timeouts, staggered-stream
//! detection, and mid-stream reconnect against a caller-supplied reissue
//! closure. Heartbeats and data writes are serialized through the single pump
//! task; the sink side only ever polls the channel.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::ProviderError;
use crate::config::StreamingConfig;
use crate::scenario::ScenarioType;
use crate::sse::heartbeat_frame;

pub type UpstreamByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Rebuilds the upstream call after a mid-stream connection error. The
/// argument is the reconnect attempt ordinal (0-based).
pub type ReissueFn = Box<
    dyn FnMut(u32) -> Pin<Box<dyn Future<Output = Result<UpstreamByteStream, ProviderError>> + Send>>
        + Send,
>;

/// Why the relay ended. The dispatcher maps this onto slot bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// Clean upstream EOF.
    Completed,
    /// Upstream failure with retries exhausted, or a relay timeout.
    Error,
    /// Cancelled via the request's token.
    Aborted,
    /// The downstream client went away.
    Disconnected,
}

#[derive(Clone, Copy, Debug)]
pub struct StaggeredConfig {
    pub max_inter_chunk_delay: Duration,
    pub min_token_rate: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct RelayConfig {
    pub heartbeat_interval: Duration,
    pub enable_keepalive: bool,
    pub backpressure_timeout: Duration,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub staggered: Option<StaggeredConfig>,
}

impl RelayConfig {
    /// Scenario-scaled relay settings. The configured read timeout is the
    /// default/longContext value; think streams get 5/3 of it and
    /// background/webSearch streams 2/3 (300s / 180s / 120s at defaults).
    pub fn from_settings(streaming: &StreamingConfig, scenario: ScenarioType) -> Self {
        let base = streaming.sse_read_timeout_ms;
        let read_timeout_ms = match scenario {
            ScenarioType::Think => base * 5 / 3,
            ScenarioType::Background | ScenarioType::WebSearch => base * 2 / 3,
            ScenarioType::Default | ScenarioType::LongContext => base,
        };
        Self {
            heartbeat_interval: Duration::from_millis(streaming.sse_heartbeat_interval_ms),
            enable_keepalive: streaming.sse_enable_keepalive,
            backpressure_timeout: Duration::from_millis(streaming.sse_backpressure_timeout_ms),
            read_timeout: Duration::from_millis(read_timeout_ms),
            max_retries: streaming.sse_max_retries,
            staggered: streaming.sse_enable_staggered_detection.then(|| StaggeredConfig {
                max_inter_chunk_delay: Duration::from_millis(streaming.sse_max_inter_chunk_delay_ms),
                min_token_rate: streaming.sse_min_token_rate,
            }),
        }
    }
}

const STAGGERED_MIN_CHUNKS: u64 = 3;
const STAGGERED_MIN_LIVE: Duration = Duration::from_secs(5);
const RELAY_CHANNEL_CAPACITY: usize = 16;

pub struct SseRelay {
    pub upstream: UpstreamByteStream,
    pub reissue: Option<ReissueFn>,
    pub config: RelayConfig,
    pub cancel: CancellationToken,
    pub on_staggered: Option<Box<dyn FnOnce() + Send>>,
}

impl SseRelay {
    /// Spawn the pump and return the downstream body stream. `on_end` runs
    /// exactly once with the final disposition, after the sink is closed.
    pub fn spawn(self, on_end: impl FnOnce(StreamEnd) + Send + 'static) -> RelayBodyStream {
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let end = self.pump(tx).await;
            on_end(end);
        });
        RelayBodyStream { rx }
    }

    async fn pump(mut self, tx: mpsc::Sender<std::io::Result<Bytes>>) -> StreamEnd {
        let started = Instant::now();
        let mut last_data = Instant::now();
        // Heartbeat cadence counts pings too, so silence produces one ping
        // per interval rather than a burst.
        let mut last_emit = Instant::now();
        let mut chunks: u64 = 0;
        let mut bytes_total: u64 = 0;
        let mut attempt: u32 = 0;
        let mut staggered_fired = false;
        let mut staggered_checked_at = Instant::now();

        loop {
            let staggered_armed = self
                .config
                .staggered
                .filter(|_| !staggered_fired && chunks >= STAGGERED_MIN_CHUNKS);
            // The check may not run before the stream has been live for the
            // minimum window, and each pass pushes the next one a full gap
            // out so an idle stream is probed once per gap, not per poll.
            let staggered_deadline = staggered_armed.map(|staggered| {
                let gap_deadline =
                    last_data.max(staggered_checked_at) + staggered.max_inter_chunk_delay;
                gap_deadline.max(started + STAGGERED_MIN_LIVE)
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return StreamEnd::Aborted;
                }
                next = self.upstream.next() => match next {
                    Some(Ok(chunk)) => {
                        chunks += 1;
                        bytes_total += chunk.len() as u64;
                        last_data = Instant::now();
                        last_emit = last_data;
                        match forward(self.config.backpressure_timeout, &tx, Ok(chunk)).await {
                            Ok(()) => {}
                            Err(end) => return end,
                        }
                    }
                    Some(Err(err)) => {
                        if attempt >= self.config.max_retries {
                            let _ = forward(
                                self.config.backpressure_timeout,
                                &tx,
                                Ok(error_frame(&err.to_string())),
                            )
                            .await;
                            return StreamEnd::Error;
                        }
                        match self.reconnect(attempt, &err.to_string()).await {
                            Some(stream) => {
                                self.upstream = stream;
                                attempt += 1;
                            }
                            None => {
                                let _ = forward(
                                    self.config.backpressure_timeout,
                                    &tx,
                                    Ok(error_frame(&err.to_string())),
                                )
                                .await;
                                return StreamEnd::Error;
                            }
                        }
                    }
                    None => {
                        return StreamEnd::Completed;
                    }
                },
                _ = tokio::time::sleep_until(last_data + self.config.read_timeout) => {
                    warn!(timeout_ms = self.config.read_timeout.as_millis() as u64,
                        "upstream read timeout; aborting stream");
                    let _ = forward(
                        self.config.backpressure_timeout,
                        &tx,
                        Ok(error_frame("upstream read timeout")),
                    )
                    .await;
                    return StreamEnd::Error;
                }
                _ = tokio::time::sleep_until(last_emit + self.config.heartbeat_interval),
                    if self.config.enable_keepalive =>
                {
                    // Keepalive comment. Deliberately does not touch
                    // last_data: heartbeats must stay invisible to the
                    // staggered detector and the read timeout.
                    last_emit = Instant::now();
                    match forward(self.config.backpressure_timeout, &tx, Ok(heartbeat_frame())).await {
                        Ok(()) => {}
                        Err(end) => return end,
                    }
                }
                _ = tokio::time::sleep_until(
                    staggered_deadline.unwrap_or_else(Instant::now)
                ), if staggered_deadline.is_some() => {
                    staggered_checked_at = Instant::now();
                    if let Some(staggered) = staggered_armed {
                        if last_data.elapsed() >= staggered.max_inter_chunk_delay {
                            let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                            let token_rate = (bytes_total as f64 / 4.0) / elapsed;
                            if token_rate < staggered.min_token_rate {
                                staggered_fired = true;
                                debug!(token_rate, "staggered stream detected");
                                if let Some(callback) = self.on_staggered.take() {
                                    callback();
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn reconnect(&mut self, attempt: u32, cause: &str) -> Option<UpstreamByteStream> {
        let reissue = self.reissue.as_mut()?;
        debug!(attempt, cause, "mid-stream reconnect");
        tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
        match reissue(attempt).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(attempt, error = %err, "reissue failed");
                None
            }
        }
    }
}

/// Write to the sink, waiting out backpressure up to the configured
/// timeout. A closed sink means the client disconnected.
async fn forward(
    backpressure_timeout: Duration,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
    item: std::io::Result<Bytes>,
) -> Result<(), StreamEnd> {
    match tx.send_timeout(item, backpressure_timeout).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
            warn!(
                timeout_ms = backpressure_timeout.as_millis() as u64,
                "downstream backpressure timeout; aborting stream"
            );
            Err(StreamEnd::Error)
        }
        Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(StreamEnd::Disconnected),
    }
}

/// Terminal error frame emitted after response headers are already out.
fn error_frame(message: &str) -> Bytes {
    let body = serde_json::json!({ "error": message });
    Bytes::from(format!("event: error\ndata: {body}\n\n"))
}

/// Downstream body half of the relay channel.
pub struct RelayBodyStream {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl Stream for RelayBodyStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
