//! End-to-end relay behavior: heartbeats, reconnect, timeouts, staggered
//! detection, and disconnect handling, all on the paused tokio clock.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use relay_llm::relay::{
    ReissueFn, RelayConfig, SseRelay, StaggeredConfig, StreamEnd, UpstreamByteStream,
};

fn config() -> RelayConfig {
    RelayConfig {
        heartbeat_interval: Duration::from_secs(30),
        enable_keepalive: true,
        backpressure_timeout: Duration::from_secs(60),
        read_timeout: Duration::from_secs(120),
        max_retries: 2,
        staggered: None,
    }
}

fn chunk(text: &str) -> Bytes {
    Bytes::from(format!("data: {text}\n\n"))
}

/// Stream that emits each `(delay, item)` pair in order, then ends.
fn timed_stream(items: Vec<(Duration, std::io::Result<Bytes>)>) -> UpstreamByteStream {
    stream::unfold(items.into_iter(), |mut items| async move {
        let (delay, item) = items.next()?;
        tokio::time::sleep(delay).await;
        Some((item, items))
    })
    .boxed()
}

struct EndCapture(Arc<Mutex<Option<StreamEnd>>>);

impl EndCapture {
    fn new() -> (Self, impl FnOnce(StreamEnd) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let writer = slot.clone();
        (Self(slot), move |end| {
            *writer.lock().unwrap() = Some(end);
        })
    }

    fn get(&self) -> Option<StreamEnd> {
        *self.0.lock().unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeats_fill_upstream_silence() {
    let upstream = timed_stream(vec![
        (Duration::ZERO, Ok(chunk("one"))),
        (Duration::from_secs(65), Ok(chunk("two"))),
    ]);
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: None,
        config: config(),
        cancel: CancellationToken::new(),
        on_staggered: None,
    };
    let mut body = relay.spawn(on_end);

    let mut frames: Vec<Bytes> = Vec::new();
    while let Some(frame) = body.next().await {
        frames.push(frame.unwrap());
    }

    let pings = frames.iter().filter(|f| f.as_ref() == b":ping\n\n").count();
    let data: Vec<&Bytes> = frames
        .iter()
        .filter(|f| f.as_ref() != b":ping\n\n")
        .collect();
    assert_eq!(data.len(), 2);
    // 65 seconds of silence at a 30s interval yields two pings.
    assert_eq!(pings, 2);
    assert_eq!(capture.get(), Some(StreamEnd::Completed));
}

#[tokio::test(start_paused = true)]
async fn mid_stream_reconnect_resumes_pumping() {
    let upstream = timed_stream(vec![
        (Duration::ZERO, Ok(chunk("1"))),
        (Duration::ZERO, Ok(chunk("2"))),
        (Duration::ZERO, Ok(chunk("3"))),
        (
            Duration::ZERO,
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        ),
    ]);
    let reissues = Arc::new(AtomicU32::new(0));
    let counter = reissues.clone();
    let reissue: ReissueFn = Box::new(move |_attempt| {
        counter.fetch_add(1, Ordering::SeqCst);
        let stream = timed_stream(vec![
            (Duration::ZERO, Ok(chunk("4"))),
            (Duration::ZERO, Ok(chunk("5"))),
        ]);
        Box::pin(async move { Ok(stream) })
    });

    let mut cfg = config();
    cfg.enable_keepalive = false;
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: Some(reissue),
        config: cfg,
        cancel: CancellationToken::new(),
        on_staggered: None,
    };
    let mut body = relay.spawn(on_end);

    let mut data = Vec::new();
    while let Some(frame) = body.next().await {
        data.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
    }

    assert_eq!(data.len(), 5);
    assert!(data[0].contains("1") && data[4].contains("5"));
    assert_eq!(reissues.load(Ordering::SeqCst), 1);
    assert_eq!(capture.get(), Some(StreamEnd::Completed));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_an_error_frame() {
    let upstream = timed_stream(vec![(
        Duration::ZERO,
        Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
    )]);
    let reissue: ReissueFn = Box::new(move |_attempt| {
        let stream = timed_stream(vec![(
            Duration::ZERO,
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        )]);
        Box::pin(async move { Ok(stream) })
    });

    let mut cfg = config();
    cfg.enable_keepalive = false;
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: Some(reissue),
        config: cfg,
        cancel: CancellationToken::new(),
        on_staggered: None,
    };
    let mut body = relay.spawn(on_end);

    let mut frames = Vec::new();
    while let Some(frame) = body.next().await {
        frames.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
    }
    assert!(frames.last().unwrap().starts_with("event: error\n"));
    assert_eq!(capture.get(), Some(StreamEnd::Error));
}

#[tokio::test(start_paused = true)]
async fn read_timeout_aborts_a_stalled_upstream() {
    let upstream: UpstreamByteStream = stream::pending().boxed();
    let mut cfg = config();
    cfg.enable_keepalive = false;
    cfg.read_timeout = Duration::from_secs(5);
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: None,
        config: cfg,
        cancel: CancellationToken::new(),
        on_staggered: None,
    };
    let mut body = relay.spawn(on_end);

    let mut frames = Vec::new();
    while let Some(frame) = body.next().await {
        frames.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
    }
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains("read timeout"));
    assert_eq!(capture.get(), Some(StreamEnd::Error));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_do_not_defeat_the_read_timeout() {
    let upstream: UpstreamByteStream = stream::pending().boxed();
    let mut cfg = config();
    cfg.heartbeat_interval = Duration::from_secs(2);
    cfg.read_timeout = Duration::from_secs(9);
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: None,
        config: cfg,
        cancel: CancellationToken::new(),
        on_staggered: None,
    };
    let mut body = relay.spawn(on_end);

    let mut pings = 0;
    while let Some(frame) = body.next().await {
        if frame.unwrap().as_ref() == b":ping\n\n" {
            pings += 1;
        }
    }
    // Pings keep flowing but the data-read deadline still fires.
    assert_eq!(pings, 4);
    assert_eq!(capture.get(), Some(StreamEnd::Error));
}

#[tokio::test(start_paused = true)]
async fn staggered_stream_fires_single_callback() {
    let upstream = timed_stream(vec![
        (Duration::ZERO, Ok(chunk("a"))),
        (Duration::from_millis(100), Ok(chunk("b"))),
        (Duration::from_millis(100), Ok(chunk("c"))),
        (Duration::from_secs(30), Ok(chunk("late"))),
    ]);
    let mut cfg = config();
    cfg.enable_keepalive = false;
    cfg.staggered = Some(StaggeredConfig {
        max_inter_chunk_delay: Duration::from_secs(3),
        min_token_rate: 1_000.0,
    });
    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: None,
        config: cfg,
        cancel: CancellationToken::new(),
        on_staggered: Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    };
    let mut body = relay.spawn(on_end);
    while body.next().await.is_some() {}

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(capture.get(), Some(StreamEnd::Completed));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_the_relay() {
    let upstream: UpstreamByteStream = stream::pending().boxed();
    let cancel = CancellationToken::new();
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: None,
        config: config(),
        cancel: cancel.clone(),
        on_staggered: None,
    };
    let mut body = relay.spawn(on_end);

    cancel.cancel();
    while body.next().await.is_some() {}
    assert_eq!(capture.get(), Some(StreamEnd::Aborted));
}

#[tokio::test(start_paused = true)]
async fn client_disconnect_is_reported() {
    let upstream = timed_stream(vec![(Duration::from_secs(1), Ok(chunk("slow")))]);
    let (capture, on_end) = EndCapture::new();
    let relay = SseRelay {
        upstream,
        reissue: None,
        config: config(),
        cancel: CancellationToken::new(),
        on_staggered: None,
    };
    let body = relay.spawn(on_end);
    drop(body);

    // Let the pump observe the closed sink.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(capture.get(), Some(StreamEnd::Disconnected));
}
