use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{Marker, Prediction, Sample};

/// One poll of a source: whatever arrived since the last poll (possibly
/// nothing), or the end-of-stream sentinel. An empty batch means
/// "temporarily idle" and is distinct from `EndOfStream`.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll<T> {
    Batch(Vec<T>),
    EndOfStream,
}

/// Continuous signal producer. `pull` must be non-blocking or
/// timeout-bounded; the run loop calls it once per iteration.
pub trait SignalSource: Send {
    fn pull(&mut self) -> Result<SourcePoll<Sample>>;
}

/// Sparse event producer, same polling contract as [`SignalSource`].
pub trait MarkerSource: Send {
    fn pull(&mut self) -> Result<SourcePoll<Marker>>;
}

/// Outbound prediction sink. Fire-and-forget: implementations log their own
/// failures and report at most a boolean, never an error the run loop would
/// have to unwind.
pub trait Messenger: Send {
    fn send(&mut self, prediction: &Prediction) -> bool;
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe queue shim standing in for a live stream inlet.
///
/// Producers (e.g. acquisition I/O threads) push through a cloned
/// [`QueueProducer`]; the run loop drains through `pull`. Once every
/// producer handle has called `close`, a drained queue reports
/// end-of-stream.
pub struct QueueSource<T> {
    inner: Arc<Mutex<QueueInner<T>>>,
}

/// Push/close handle for a [`QueueSource`].
pub struct QueueProducer<T> {
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueSource<T> {
    pub fn channel() -> (QueueProducer<T>, QueueSource<T>) {
        let inner = Arc::new(Mutex::new(QueueInner {
            items: VecDeque::new(),
            closed: false,
        }));
        (
            QueueProducer {
                inner: inner.clone(),
            },
            QueueSource { inner },
        )
    }

    fn poll(&mut self) -> SourcePoll<T> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            if inner.closed {
                return SourcePoll::EndOfStream;
            }
            return SourcePoll::Batch(Vec::new());
        }
        SourcePoll::Batch(inner.items.drain(..).collect())
    }
}

impl<T> QueueProducer<T> {
    pub fn push(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.inner.lock();
        inner.items.extend(items);
    }

    /// Mark the stream finished. Buffered items are still delivered before
    /// the source reports end-of-stream.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }
}

impl SignalSource for QueueSource<Sample> {
    fn pull(&mut self) -> Result<SourcePoll<Sample>> {
        Ok(self.poll())
    }
}

impl MarkerSource for QueueSource<Marker> {
    fn pull(&mut self) -> Result<SourcePoll<Marker>> {
        Ok(self.poll())
    }
}

/// Pre-recorded finite stream, replayed in fixed-size chunks and followed by
/// end-of-stream. This is the offline (`online = false`) delivery vehicle.
pub struct ReplaySource<T> {
    items: Vec<T>,
    cursor: usize,
    chunk_size: usize,
}

impl<T: Clone> ReplaySource<T> {
    pub fn new(items: Vec<T>, chunk_size: usize) -> Self {
        Self {
            items,
            cursor: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    fn poll(&mut self) -> SourcePoll<T> {
        if self.cursor >= self.items.len() {
            return SourcePoll::EndOfStream;
        }
        let end = (self.cursor + self.chunk_size).min(self.items.len());
        let batch = self.items[self.cursor..end].to_vec();
        self.cursor = end;
        SourcePoll::Batch(batch)
    }
}

impl SignalSource for ReplaySource<Sample> {
    fn pull(&mut self) -> Result<SourcePoll<Sample>> {
        Ok(self.poll())
    }
}

impl MarkerSource for ReplaySource<Marker> {
    fn pull(&mut self) -> Result<SourcePoll<Marker>> {
        Ok(self.poll())
    }
}

/// Logs each prediction as a JSON line at info level.
#[derive(Debug, Default)]
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn send(&mut self, prediction: &Prediction) -> bool {
        match serde_json::to_string(prediction) {
            Ok(json) => {
                log::info!("Prediction: {}", json);
                true
            }
            Err(e) => {
                log::error!("Failed to serialize prediction {}: {}", prediction.id, e);
                false
            }
        }
    }
}

/// Captures sent predictions in shared memory. Clones observe the same
/// backing store, so a caller can keep one handle while the controller owns
/// the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessenger {
    sent: Arc<Mutex<Vec<Prediction>>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Prediction> {
        self.sent.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Messenger for MemoryMessenger {
    fn send(&mut self, prediction: &Prediction) -> bool {
        self.sent.lock().push(prediction.clone());
        true
    }
}
