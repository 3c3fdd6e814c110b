//! Output queue, single-flight flusher, and input flow control.
//!
//! Every event line is appended to the [`Outbox`] and written to the sink by
//! exactly one flusher task, one line at a time, at the sink's own pace.
//! The session pauses all input readers through the watch-channel gate when
//! the unflushed depth reaches the configured maximum and resumes them once
//! it falls under half of it.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};

pub const DEFAULT_MAX_OUT_QUEUE: usize = 20_000;

#[derive(Debug, Default)]
struct OutboxInner {
    lines: Vec<String>,
    /// Lines before the cursor were accepted by the sink and are garbage
    /// collected once the whole queue drains.
    cursor: usize,
    sink_writes: u64,
    sink_backpressure: u64,
}

impl OutboxInner {
    fn depth(&self) -> usize {
        self.lines.len() - self.cursor
    }
}

/// Ordered queue of serialized event lines shared between the session loop
/// (producer) and the flusher task (consumer).
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<Mutex<OutboxInner>>,
    notify: Arc<Notify>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutboxInner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append one line and wake the flusher. Returns the depth after the
    /// append.
    pub fn push(&self, line: String) -> usize {
        let depth = {
            let mut inner = self.inner.lock().expect("outbox lock");
            inner.lines.push(line);
            inner.depth()
        };
        self.notify.notify_one();
        depth
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("outbox lock").depth()
    }

    /// (sink writes, sink backpressure stalls) observed by the flusher.
    pub fn sink_stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("outbox lock");
        (inner.sink_writes, inner.sink_backpressure)
    }

    /// Drain the queue into `sink`, one line per write. `on_drained` runs
    /// every time the queue empties so the session can auto-resume input and
    /// complete a deferred exit. Returns when the sink errors out; by then
    /// there is nowhere left to report to.
    pub async fn run_flusher<W, F>(self, mut sink: W, mut on_drained: F)
    where
        W: AsyncWrite + Unpin,
        F: FnMut(),
    {
        loop {
            let notified = self.notify.notified();

            let next = {
                let inner = self.inner.lock().expect("outbox lock");
                inner.lines.get(inner.cursor).cloned()
            };

            match next {
                Some(line) => {
                    if write_line(&mut sink, line.as_bytes(), &self.inner)
                        .await
                        .is_err()
                        || sink.flush().await.is_err()
                    {
                        tracing::debug!("event sink closed; stopping flusher");
                        return;
                    }

                    let drained = {
                        let mut inner = self.inner.lock().expect("outbox lock");
                        inner.cursor += 1;
                        inner.sink_writes += 1;
                        if inner.cursor >= inner.lines.len() {
                            inner.lines.clear();
                            inner.cursor = 0;
                            true
                        } else {
                            false
                        }
                    };
                    if drained {
                        on_drained();
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Write a full line, counting one backpressure stall per line the first
/// time the sink reports it cannot accept more without blocking.
async fn write_line<W: AsyncWrite + Unpin>(
    sink: &mut W,
    buf: &[u8],
    inner: &Mutex<OutboxInner>,
) -> io::Result<()> {
    let mut written = 0;
    let mut stalled = false;

    while written < buf.len() {
        let n = std::future::poll_fn(|cx| match Pin::new(&mut *sink).poll_write(cx, &buf[written..])
        {
            Poll::Pending => {
                if !stalled {
                    stalled = true;
                    inner.lock().expect("outbox lock").sink_backpressure += 1;
                }
                Poll::Pending
            }
            ready => ready,
        })
        .await?;

        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "sink closed"));
        }
        written += n;
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// Output queue crossed the high-water mark; auto-lifted on drain.
    Backpressure,
    /// Operator/controller shutdown; never auto-lifted.
    Shutdown,
}

/// Loop-side flow control: owns the outbox handle, the reader pause gate,
/// and the pause/resume bookkeeping.
pub struct Transport {
    outbox: Outbox,
    max_out_queue: usize,
    gate: watch::Sender<bool>,
    pause: Option<(PauseKind, String)>,
    pub io_pauses: u64,
    pub io_resumes: u64,
    pub high_water: usize,
}

impl Transport {
    pub fn new(max_out_queue: usize) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            outbox: Outbox::new(),
            max_out_queue,
            gate,
            pause: None,
            io_pauses: 0,
            io_resumes: 0,
            high_water: 0,
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// New receiver for a reader task; `true` means paused.
    pub fn gate(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    pub fn depth(&self) -> usize {
        self.outbox.depth()
    }

    pub fn push(&mut self, line: String) -> usize {
        let depth = self.outbox.push(line);
        if depth > self.high_water {
            self.high_water = depth;
        }
        depth
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_some()
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.pause.as_ref().map(|(_, reason)| reason.as_str())
    }

    pub fn should_pause(&self, depth: usize) -> bool {
        self.max_out_queue > 0 && depth >= self.max_out_queue && self.pause.is_none()
    }

    /// Pause all readers. Returns false if already paused (the first reason
    /// wins, as in the original flow control).
    pub fn pause(&mut self, kind: PauseKind, reason: String) -> bool {
        if self.pause.is_some() {
            return false;
        }
        self.pause = Some((kind, reason));
        self.io_pauses += 1;
        let _ = self.gate.send(true);
        true
    }

    /// Only a backpressure pause auto-lifts, and only once the queue has
    /// drained below half the maximum.
    pub fn should_resume(&self) -> bool {
        matches!(self.pause, Some((PauseKind::Backpressure, _)))
            && self.outbox.depth() < self.max_out_queue / 2
    }

    pub fn resume(&mut self) -> bool {
        if self.pause.is_none() {
            return false;
        }
        self.pause = None;
        self.io_resumes += 1;
        let _ = self.gate.send(false);
        true
    }
}

/// Wait until the gate is open. Returns false when the session is gone.
pub async fn gate_open(gate: &mut watch::Receiver<bool>) -> bool {
    loop {
        if !*gate.borrow() {
            return true;
        }
        if gate.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn drive(transport: &mut Transport, line: &str) -> (bool, bool) {
        let depth = transport.push(line.to_string());
        let paused = if transport.should_pause(depth) {
            transport.pause(PauseKind::Backpressure, format!("outQueue>={}", depth))
        } else {
            false
        };
        let resumed = if transport.should_resume() {
            transport.resume()
        } else {
            false
        };
        (paused, resumed)
    }

    #[tokio::test]
    async fn pause_fires_once_at_high_water_and_resume_after_drain() {
        let mut transport = Transport::new(200);
        let outbox = transport.outbox();

        let mut pauses = 0;
        for i in 0..250 {
            let (paused, _) = drive(&mut transport, &format!("line {i}\n"));
            if paused {
                pauses += 1;
                assert_eq!(i, 199, "pause should fire at the high-water mark");
            }
        }
        assert_eq!(pauses, 1);
        assert!(transport.is_paused());
        assert_eq!(transport.high_water, 250);
        assert_eq!(transport.io_pauses, 1);

        // Depth may exceed the mark only by what was already in flight.
        assert_eq!(transport.depth(), 250);

        let (drained_tx, mut drained_rx) = mpsc::unbounded_channel();
        let sink = Vec::new();
        tokio::spawn(outbox.run_flusher(sink, move || {
            let _ = drained_tx.send(());
        }));

        drained_rx.recv().await.expect("drain notification");
        assert_eq!(transport.depth(), 0);
        assert!(transport.should_resume());
        assert!(transport.resume());
        assert!(!transport.is_paused());
        assert_eq!(transport.io_resumes, 1);
    }

    #[tokio::test]
    async fn shutdown_pause_is_not_auto_lifted() {
        let mut transport = Transport::new(100);
        assert!(transport.pause(PauseKind::Shutdown, "client-exit".into()));
        assert!(!transport.should_resume());

        // A later backpressure condition does not replace the reason.
        assert!(!transport.pause(PauseKind::Backpressure, "outQueue>=100".into()));
        assert_eq!(transport.pause_reason(), Some("client-exit"));
    }

    #[tokio::test]
    async fn flusher_preserves_order_and_gc_runs_after_drain() {
        let outbox = Outbox::new();
        for i in 0..10 {
            outbox.push(format!("{i}\n"));
        }

        let (drained_tx, mut drained_rx) = mpsc::unbounded_channel();
        let (sink, mut read_half) = tokio::io::duplex(4096);
        let handle = tokio::spawn(outbox.clone().run_flusher(sink, move || {
            let _ = drained_tx.send(());
        }));

        drained_rx.recv().await.expect("drained");
        assert_eq!(outbox.depth(), 0);
        let (writes, _) = outbox.sink_stats();
        assert_eq!(writes, 10);

        handle.abort();
        let mut buf = Vec::new();
        let _ = read_half.read_to_end(&mut buf).await;
        let text = String::from_utf8(buf).unwrap();
        let expected: String = (0..10).map(|i| format!("{i}\n")).collect();
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn slow_sink_counts_backpressure_stalls() {
        let outbox = Outbox::new();
        // Line larger than the duplex buffer so the first write must stall.
        outbox.push("x".repeat(64) + "\n");

        let (sink, mut read_half) = tokio::io::duplex(16);
        let (drained_tx, mut drained_rx) = mpsc::unbounded_channel();
        tokio::spawn(outbox.clone().run_flusher(sink, move || {
            let _ = drained_tx.send(());
        }));

        let mut buf = vec![0u8; 65];
        read_half.read_exact(&mut buf).await.unwrap();
        drained_rx.recv().await.expect("drained");

        let (writes, stalls) = outbox.sink_stats();
        assert_eq!(writes, 1);
        assert!(stalls >= 1);
    }

    #[tokio::test]
    async fn gate_open_waits_for_resume() {
        let mut transport = Transport::new(10);
        let mut gate = transport.gate();
        assert!(gate_open(&mut gate).await);

        transport.pause(PauseKind::Backpressure, "outQueue>=10".into());
        let mut gate2 = transport.gate();
        let waiter = tokio::spawn(async move { gate_open(&mut gate2).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        transport.resume();
        assert!(waiter.await.unwrap());
    }
}
