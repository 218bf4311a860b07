use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Response, StatusCode, header};
use futures_util::stream;
use llm_relay_core::queue::{
    Dispatch, HeartbeatAction, HeartbeatMonitor, HeartbeatSettings, INIT_FRAME, QueueTicket,
    RequestQueue, StallReason, heartbeat_frame, heartbeat_size,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Frames buffered between the driver and the socket before heartbeats count as blocked.
const SSE_BUFFER_FRAMES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Accepted,
    Full,
    Closed,
}

/// Write half of a streaming response. Bytes count as flushed once the HTTP layer pulls
/// them from the channel.
#[derive(Clone)]
pub struct SseSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    flushed: Arc<AtomicU64>,
}

impl SseSink {
    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Non-blocking write used for heartbeats; a full buffer is reported, not waited on.
    pub fn try_write(&self, frame: impl Into<Bytes>) -> WriteState {
        match self.tx.try_send(Ok(frame.into())) {
            Ok(()) => WriteState::Accepted,
            Err(TrySendError::Full(_)) => WriteState::Full,
            Err(TrySendError::Closed(_)) => WriteState::Closed,
        }
    }

    /// Returns false once the client is gone.
    pub async fn write(&self, frame: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(frame.into())).await.is_ok()
    }

    /// Terminate the response with a body error so the connection is torn down once the
    /// HTTP layer polls it. Does nothing when the buffer is already full.
    pub fn abort(&self, err: io::Error) {
        let _ = self.tx.try_send(Err(err));
    }
}

pub fn sse_channel() -> (SseSink, Body) {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(SSE_BUFFER_FRAMES);
    let flushed = Arc::new(AtomicU64::new(0));
    let counter = flushed.clone();
    let body_stream = stream::unfold((rx, counter), |(mut rx, counter)| async move {
        let item = rx.recv().await?;
        if let Ok(bytes) = &item {
            counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        Some((item, (rx, counter)))
    });
    (SseSink { tx, flushed }, Body::from_stream(body_stream))
}

pub fn sse_response(body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Dispatched(Dispatch),
    ClientGone,
    Stalled(StallReason),
}

/// Wait for the scheduler while keeping the client connection warm.
///
/// Heartbeats go out every `settings.interval`, sized by the queue's current load. Every
/// second interval the monitor compares flushed bytes with half a heartbeat. Heartbeat and
/// monitor timers live only inside this call, so they stop before the request resumes.
/// Greet a queued streaming client with the join comment and its first heartbeat.
pub fn open_queued_stream(sink: &SseSink, settings: &HeartbeatSettings, queue: &RequestQueue) {
    let _ = sink.try_write(INIT_FRAME);
    let _ = sink.try_write(heartbeat_frame(heartbeat_size(settings, queue.load())));
}

pub async fn wait_with_heartbeat(
    ticket: &mut QueueTicket,
    sink: &SseSink,
    settings: &HeartbeatSettings,
    queue: &RequestQueue,
) -> WaitOutcome {
    let now = Instant::now();
    let mut heartbeat = interval_at(now + settings.interval, settings.interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let monitor_every = settings.monitor_interval();
    let mut monitor_tick = interval_at(now + monitor_every, monitor_every);
    monitor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut monitor = HeartbeatMonitor::new(sink.flushed());

    loop {
        tokio::select! {
            biased;
            dispatch = ticket.wait() => return WaitOutcome::Dispatched(dispatch),
            _ = sink.closed() => return WaitOutcome::ClientGone,
            _ = monitor_tick.tick() => {
                let size = heartbeat_size(settings, queue.load());
                if let HeartbeatAction::Destroy(reason) = monitor.on_monitor(sink.flushed(), size) {
                    return WaitOutcome::Stalled(reason);
                }
            }
            _ = heartbeat.tick() => {
                let size = heartbeat_size(settings, queue.load());
                let accepted = match sink.try_write(heartbeat_frame(size)) {
                    WriteState::Accepted => true,
                    WriteState::Full => false,
                    WriteState::Closed => return WaitOutcome::ClientGone,
                };
                if let HeartbeatAction::Destroy(reason) = monitor.on_write(accepted) {
                    return WaitOutcome::Stalled(reason);
                }
            }
        }
    }
}
