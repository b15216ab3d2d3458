//! Output stream and download rendezvous
//!
//! An output stream is a bounded channel of `Bytes` plus an abort signal.
//! The producing end (`OutputStream`) belongs to the coordinator for one job;
//! the consuming end (`DownloadBody`) becomes an HTTP body or a file sink.
//!
//! `DownloadHub` lets either end arrive first. A job that is prepared before
//! anyone asks for the download parks its body in the hub; a consumer that
//! asks first gets a body immediately and parks the producing end for the
//! next job to adopt.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::message::Reply;

/// Producing end of one download.
pub struct OutputStream {
    tx: Option<mpsc::Sender<Bytes>>,
    abort: watch::Sender<Option<String>>,
    file_name: String,
    generation: u64,
    hub: Weak<HubInner>,
    live: Arc<AtomicUsize>,
    bytes_written: u64,
    finished: bool,
    aborted: bool,
}

impl OutputStream {
    /// Write one buffer, waiting while the consumer is behind.
    ///
    /// Fails with `Cancelled` once the consumer has gone away.
    pub async fn write(&mut self, bytes: Bytes) -> Result<(), TransferError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransferError::Sequencing("output stream already closed".into()))?;
        let len = bytes.len() as u64;
        tx.send(bytes).await.map_err(|_| TransferError::Cancelled)?;
        self.bytes_written += len;
        Ok(())
    }

    /// End the body cleanly.
    pub fn close(mut self) {
        self.finished = true;
        self.tx.take();
        debug!(file = %self.file_name, bytes = self.bytes_written, "output stream closed");
    }

    /// End the body with an error the consumer will observe instead of EOF.
    pub fn abort(mut self, reason: &str) {
        self.abort.send_replace(Some(reason.to_string()));
        self.finished = true;
        self.aborted = true;
        self.tx.take();
        debug!(file = %self.file_name, reason, "output stream aborted");
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the consuming end has been dropped.
    pub fn is_consumer_gone(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if !self.finished {
            self.abort
                .send_replace(Some("output stream dropped before completion".into()));
            self.aborted = true;
        }
        self.tx.take();
        self.live.fetch_sub(1, Ordering::AcqRel);
        if let Some(hub) = self.hub.upgrade() {
            hub.release(self.generation, self.aborted);
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("file_name", &self.file_name)
            .field("generation", &self.generation)
            .field("bytes_written", &self.bytes_written)
            .finish_non_exhaustive()
    }
}

/// Consuming end of one download.
pub struct DownloadBody {
    file_name: String,
    rx: mpsc::Receiver<Bytes>,
    abort: watch::Receiver<Option<String>>,
}

impl DownloadBody {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Body as a stream of buffers. An aborted producer surfaces as an
    /// `io::Error` item; a clean close as the end of the stream.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(Some((self, true)), |state| async move {
            let Some((mut body, mut abort_live)) = state else {
                return None;
            };
            loop {
                let aborted = body.abort.borrow().clone();
                if let Some(reason) = aborted {
                    return Some((Err(io::Error::other(reason)), None));
                }
                tokio::select! {
                    changed = body.abort.changed(), if abort_live => {
                        if changed.is_err() {
                            abort_live = false;
                        }
                    }
                    chunk = body.rx.recv() => {
                        return match chunk {
                            Some(bytes) => Some((Ok(bytes), Some((body, abort_live)))),
                            None => {
                                let reason = body.abort.borrow().clone();
                                reason.map(|r| (Err(io::Error::other(r)), None))
                            }
                        };
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for DownloadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadBody")
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// A detached pipe, not tracked by any hub.
pub fn pipe(file_name: impl Into<String>, capacity: usize) -> (OutputStream, DownloadBody) {
    new_pipe(file_name.into(), capacity, 0, Weak::new(), Arc::new(AtomicUsize::new(1)))
}

fn new_pipe(
    file_name: String,
    capacity: usize,
    generation: u64,
    hub: Weak<HubInner>,
    live: Arc<AtomicUsize>,
) -> (OutputStream, DownloadBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (abort_tx, abort_rx) = watch::channel(None);
    let stream = OutputStream {
        tx: Some(tx),
        abort: abort_tx,
        file_name: file_name.clone(),
        generation,
        hub,
        live,
        bytes_written: 0,
        finished: false,
        aborted: false,
    };
    let body = DownloadBody {
        file_name,
        rx,
        abort: abort_rx,
    };
    (stream, body)
}

enum Slot {
    Empty,
    /// Job prepared, body waiting for a consumer. `closed` once the producing
    /// end finished cleanly; the body still holds the buffered output.
    Armed {
        generation: u64,
        body: DownloadBody,
        closed: bool,
    },
    /// Consumer attached first, producing end waiting for a job.
    Waiting { generation: u64, stream: OutputStream },
    /// Both ends handed out.
    Streaming { generation: u64 },
}

struct HubInner {
    slot: Mutex<Slot>,
    armed: Notify,
    capacity: usize,
    default_file_name: String,
    generation: AtomicU64,
    live: Arc<AtomicUsize>,
    peak: AtomicUsize,
    events: Option<mpsc::UnboundedSender<Reply>>,
}

impl HubInner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called when the producing end of `generation` goes away. An unclaimed
    /// body survives a clean close so a late consumer still receives it.
    fn release(&self, generation: u64, aborted: bool) {
        let mut slot = self.lock();
        match &mut *slot {
            Slot::Armed {
                generation: g,
                closed,
                ..
            } if *g == generation => {
                if !aborted {
                    *closed = true;
                    debug!(generation, "output finished before a consumer attached; kept for pickup");
                    return;
                }
            }
            Slot::Streaming { generation: g } if *g == generation => {}
            _ => return,
        }
        let previous = std::mem::replace(&mut *slot, Slot::Empty);
        drop(slot);
        drop(previous);
    }

    fn emit_started(&self) {
        if let Some(events) = &self.events {
            let _ = events.send(Reply::DownloadStarted);
        }
    }
}

/// Hand out an armed body. A body whose producer already closed leaves
/// nothing to track, so the slot empties.
fn take_armed(slot: &mut Slot) -> Option<DownloadBody> {
    match std::mem::replace(slot, Slot::Empty) {
        Slot::Armed {
            generation,
            body,
            closed,
        } => {
            if !closed {
                *slot = Slot::Streaming { generation };
            }
            Some(body)
        }
        other => {
            *slot = other;
            None
        }
    }
}

/// Shared rendezvous between the coordinator and download consumers.
#[derive(Clone)]
pub struct DownloadHub {
    inner: Arc<HubInner>,
}

impl DownloadHub {
    /// `events` receives `DownloadStarted` whenever a consumer meets a job.
    pub fn new(
        capacity: usize,
        default_file_name: impl Into<String>,
        events: Option<mpsc::UnboundedSender<Reply>>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                slot: Mutex::new(Slot::Empty),
                armed: Notify::new(),
                capacity,
                default_file_name: default_file_name.into(),
                generation: AtomicU64::new(0),
                live: Arc::new(AtomicUsize::new(0)),
                peak: AtomicUsize::new(0),
                events,
            }),
        }
    }

    fn create(&self, file_name: String) -> (u64, OutputStream, DownloadBody) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let now = self.inner.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
        let (stream, body) = new_pipe(
            file_name,
            self.inner.capacity,
            generation,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.live),
        );
        (generation, stream, body)
    }

    /// Prepare the output for a job named `file_name`, adopting a waiting
    /// consumer if there is one.
    pub fn arm(&self, file_name: &str) -> OutputStream {
        let mut slot = self.inner.lock();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Waiting { generation, stream } => {
                *slot = Slot::Streaming { generation };
                drop(slot);
                if stream.file_name() != file_name {
                    warn!(
                        requested = %file_name,
                        served = %stream.file_name(),
                        "consumer attached before the job was prepared; download keeps the default file name"
                    );
                }
                self.inner.emit_started();
                stream
            }
            previous => {
                let (generation, stream, body) = self.create(file_name.to_string());
                *slot = Slot::Armed {
                    generation,
                    body,
                    closed: false,
                };
                drop(slot);
                if let Slot::Armed { body, .. } = &previous {
                    debug!(file = %body.file_name(), "replacing unclaimed download");
                }
                drop(previous);
                self.inner.armed.notify_waiters();
                debug!(file = %file_name, generation, "download armed");
                stream
            }
        }
    }

    /// Attach a consumer without waiting. Returns `None` while another
    /// consumer already holds the current download.
    pub fn attach(&self) -> Option<DownloadBody> {
        let mut slot = self.inner.lock();
        if let Some(body) = take_armed(&mut slot) {
            drop(slot);
            self.inner.emit_started();
            return Some(body);
        }
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Empty => {
                let name = self.inner.default_file_name.clone();
                let (generation, stream, body) = self.create(name);
                *slot = Slot::Waiting { generation, stream };
                drop(slot);
                warn!(
                    file = %self.inner.default_file_name,
                    "download requested before any job was prepared; using the default file name"
                );
                Some(body)
            }
            busy => {
                *slot = busy;
                None
            }
        }
    }

    /// Wait until a job is armed, then attach to it.
    pub async fn next_download(&self) -> DownloadBody {
        loop {
            let notified = self.inner.armed.notified();
            {
                let mut slot = self.inner.lock();
                if let Some(body) = take_armed(&mut slot) {
                    drop(slot);
                    self.inner.emit_started();
                    return body;
                }
            }
            notified.await;
        }
    }

    /// True when a job is armed and waiting for its consumer.
    pub fn is_armed(&self) -> bool {
        matches!(&*self.inner.lock(), Slot::Armed { .. })
    }

    /// True once a consumer holds the body of `generation`.
    pub(crate) fn is_attached(&self, generation: u64) -> bool {
        matches!(&*self.inner.lock(), Slot::Streaming { generation: g } if *g == generation)
    }

    /// Producing ends currently alive.
    pub fn live_streams(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Highest number of producing ends ever alive at once.
    pub fn peak_live_streams(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    pub fn default_file_name(&self) -> &str {
        &self.inner.default_file_name
    }
}

impl std::fmt::Debug for DownloadHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHub")
            .field("live_streams", &self.live_streams())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(body: DownloadBody) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut stream = Box::pin(body.into_stream());
        while let Some(item) = stream.next().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_close_ends_cleanly() {
        let (mut out, body) = pipe("a.enc", 4);
        out.write(Bytes::from_static(b"ab")).await.unwrap();
        out.write(Bytes::from_static(b"cd")).await.unwrap();
        out.close();
        assert_eq!(collect(body).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_abort_surfaces_error() {
        let (mut out, body) = pipe("a.enc", 4);
        out.write(Bytes::from_static(b"ab")).await.unwrap();
        out.abort("authentication failed");
        let err = collect(body).await.unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_drop_without_close_is_abort() {
        let (out, body) = pipe("a.enc", 4);
        drop(out);
        assert!(collect(body).await.is_err());
    }

    #[tokio::test]
    async fn test_backpressure_bounds_buffer() {
        let (mut out, body) = pipe("a.enc", 1);
        out.write(Bytes::from_static(b"1")).await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            out.write(Bytes::from_static(b"2")),
        )
        .await;
        assert!(blocked.is_err(), "second write must wait for the consumer");
        drop(body);
    }

    #[tokio::test]
    async fn test_write_after_consumer_gone() {
        let (mut out, body) = pipe("a.enc", 1);
        drop(body);
        assert!(out.is_consumer_gone());
        assert_eq!(
            out.write(Bytes::from_static(b"x")).await.unwrap_err(),
            TransferError::Cancelled
        );
    }

    #[tokio::test]
    async fn test_hub_arm_then_attach() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = DownloadHub::new(4, "encrypted_file.enc", Some(tx));

        let out = hub.arm("report.pdf.enc");
        assert!(hub.is_armed());
        let body = hub.attach().unwrap();
        assert_eq!(body.file_name(), "report.pdf.enc");
        assert_eq!(rx.recv().await, Some(Reply::DownloadStarted));

        // second consumer is turned away while the first is streaming
        assert!(hub.attach().is_none());
        assert_eq!(hub.live_streams(), 1);

        out.close();
        assert_eq!(hub.live_streams(), 0);
        assert!(collect(body).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hub_attach_before_arm_uses_default_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = DownloadHub::new(4, "encrypted_file.enc", Some(tx));

        let body = hub.attach().unwrap();
        assert_eq!(body.file_name(), "encrypted_file.enc");
        assert_eq!(hub.live_streams(), 1);

        let mut out = hub.arm("notes.txt.enc");
        assert_eq!(rx.recv().await, Some(Reply::DownloadStarted));
        out.write(Bytes::from_static(b"early")).await.unwrap();
        out.close();
        assert_eq!(collect(body).await.unwrap(), b"early");
        assert_eq!(hub.peak_live_streams(), 1);
    }

    #[tokio::test]
    async fn test_next_download_waits_for_arm() {
        let hub = DownloadHub::new(4, "encrypted_file.enc", None);
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.next_download().await })
        };
        tokio::task::yield_now().await;
        let out = hub.arm("x.enc");
        let body = waiter.await.unwrap();
        assert_eq!(body.file_name(), "x.enc");
        out.close();
    }

    #[tokio::test]
    async fn test_closed_output_waits_for_late_consumer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = DownloadHub::new(4, "encrypted_file.enc", Some(tx));

        let mut out = hub.arm("small.txt.enc");
        out.write(Bytes::from_static(b"prefix+final")).await.unwrap();
        out.close();
        assert!(hub.is_armed());
        assert_eq!(hub.live_streams(), 0);

        let body = hub.attach().unwrap();
        assert_eq!(body.file_name(), "small.txt.enc");
        assert_eq!(rx.recv().await, Some(Reply::DownloadStarted));
        let bytes = tokio::time::timeout(std::time::Duration::from_secs(1), collect(body))
            .await
            .expect("body ends after the buffered bytes")
            .unwrap();
        assert_eq!(bytes, b"prefix+final");

        // nothing left to track once the finished body was handed out
        assert!(!hub.is_armed());
        let next = hub.attach().unwrap();
        assert_eq!(next.file_name(), "encrypted_file.enc");
    }

    #[tokio::test]
    async fn test_next_download_picks_up_closed_output() {
        let hub = DownloadHub::new(4, "encrypted_file.enc", None);
        let mut out = hub.arm("done.enc");
        out.write(Bytes::from_static(b"all of it")).await.unwrap();
        out.close();

        let body = hub.next_download().await;
        assert_eq!(body.file_name(), "done.enc");
        assert_eq!(collect(body).await.unwrap(), b"all of it");
    }

    #[tokio::test]
    async fn test_aborted_unclaimed_output_is_discarded() {
        let hub = DownloadHub::new(4, "encrypted_file.enc", None);
        let mut out = hub.arm("bad.enc");
        out.write(Bytes::from_static(b"partial")).await.unwrap();
        out.abort("authentication failed");
        assert!(!hub.is_armed());
    }

    #[tokio::test]
    async fn test_is_attached_tracks_generation() {
        let hub = DownloadHub::new(4, "encrypted_file.enc", None);
        let out = hub.arm("x.enc");
        assert!(!hub.is_attached(out.generation()));
        let _body = hub.attach().unwrap();
        assert!(hub.is_attached(out.generation()));
        assert!(!hub.is_attached(out.generation() + 1));
    }

    #[tokio::test]
    async fn test_release_frees_slot_for_next_job() {
        let hub = DownloadHub::new(4, "encrypted_file.enc", None);
        let out = hub.arm("one.enc");
        let _body = hub.attach().unwrap();
        out.abort("boom");

        let out2 = hub.arm("two.enc");
        let body2 = hub.attach().unwrap();
        assert_eq!(body2.file_name(), "two.enc");
        out2.close();
        assert_eq!(hub.peak_live_streams(), 1);
    }
}
