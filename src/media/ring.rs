//! Frame ring buffer
//!
//! Fixed-capacity circular buffer with exactly one writer and any number of
//! independent readers.
//!
//! ```text
//!            committed = 7, capacity = 4
//!
//!   slot:    [0]      [1]      [2]      [3]
//!   seq:      4        5        6        3
//!                               ▲        ▲
//!                           newest   oldest valid
//!
//!   reader.next = 7  -> waits for the next commit
//!   reader.next = 2  -> overwritten, skips to 3
//! ```
//!
//! The writer stores a frame in slot `seq % capacity` and only then
//! publishes the new cursor, so a reader never sees a slot the writer has
//! not committed. A reader that falls more than `capacity` frames behind
//! loses the overwritten frames and continues from the oldest one still in
//! the ring; the publisher is never slowed down by a slow reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::frame::AVFrame;

#[derive(Default)]
struct Slot {
    sequence: u64,
    frame: Option<Arc<AVFrame>>,
}

struct Shared {
    slots: Box<[RwLock<Slot>]>,
    /// Number of committed frames
    cursor: watch::Sender<u64>,
    closed: AtomicBool,
}

impl Shared {
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn slot(&self, sequence: u64) -> &RwLock<Slot> {
        // capacity is at least 1, so the index is always in range
        &self.slots[(sequence % self.capacity()) as usize]
    }

    fn read_slot(&self, sequence: u64) -> Option<Arc<AVFrame>> {
        let slot = self
            .slot(sequence)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.frame {
            Some(ref frame) if slot.sequence == sequence => Some(Arc::clone(frame)),
            _ => None,
        }
    }

    fn committed(&self) -> u64 {
        *self.cursor.borrow()
    }
}

/// Constructor for a writer/handle pair
pub struct RingBuffer;

impl RingBuffer {
    /// Create a ring with `capacity` slots (at least one)
    pub fn new(capacity: usize) -> (RingWriter, RingHandle) {
        let slots = (0..capacity.max(1))
            .map(|_| RwLock::new(Slot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let (cursor, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            slots,
            cursor,
            closed: AtomicBool::new(false),
        });

        (
            RingWriter {
                shared: Arc::clone(&shared),
                last: None,
            },
            RingHandle { shared },
        )
    }
}

/// The single writer of a ring
///
/// Not `Clone`: whoever owns it is the only producer. Dropping it closes
/// the ring and wakes every waiting reader.
pub struct RingWriter {
    shared: Arc<Shared>,
    last: Option<Arc<AVFrame>>,
}

impl RingWriter {
    /// Commit a frame and advance the write cursor
    ///
    /// Assigns the frame's sequence number and returns the shared frame.
    pub fn commit(&mut self, mut frame: AVFrame) -> Arc<AVFrame> {
        let sequence = self.shared.committed();
        frame.sequence = sequence;
        let frame = Arc::new(frame);

        {
            let mut slot = self
                .shared
                .slot(sequence)
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            slot.sequence = sequence;
            slot.frame = Some(Arc::clone(&frame));
        }
        self.shared.cursor.send_replace(sequence + 1);

        self.last = Some(Arc::clone(&frame));
        frame
    }

    /// Most recently committed frame
    pub fn last(&self) -> Option<&Arc<AVFrame>> {
        self.last.as_ref()
    }

    /// Number of frames committed so far
    pub fn committed(&self) -> u64 {
        self.shared.committed()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// A shared view for cloning reader cursors
    pub fn handle(&self) -> RingHandle {
        RingHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cursor.send_modify(|_| {});
    }
}

/// Cloneable read-only view of a ring
#[derive(Clone)]
pub struct RingHandle {
    shared: Arc<Shared>,
}

impl RingHandle {
    /// A new cursor positioned at the writer's current slot
    ///
    /// The first frame it yields is the next one committed.
    pub fn reader(&self) -> RingReader {
        let rx = self.shared.cursor.subscribe();
        let next = *rx.borrow();
        RingReader {
            shared: Arc::clone(&self.shared),
            rx,
            next,
            skipped: 0,
        }
    }

    /// Most recently committed frame
    pub fn latest(&self) -> Option<Arc<AVFrame>> {
        match self.shared.committed() {
            0 => None,
            committed => self.shared.read_slot(committed - 1),
        }
    }

    /// Commit time of the most recent frame
    pub fn last_write_time(&self) -> Option<Instant> {
        self.latest().and_then(|frame| frame.written_at)
    }

    pub fn committed(&self) -> u64 {
        self.shared.committed()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Whether the writer has gone away
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// An independent read cursor
pub struct RingReader {
    shared: Arc<Shared>,
    rx: watch::Receiver<u64>,
    next: u64,
    skipped: u64,
}

impl RingReader {
    /// Read the next committed frame without waiting
    pub fn try_next(&mut self) -> Option<Arc<AVFrame>> {
        loop {
            let committed = *self.rx.borrow_and_update();
            if self.next >= committed {
                return None;
            }

            let capacity = self.shared.capacity();
            if committed - self.next > capacity {
                let oldest = committed - capacity;
                self.skipped += oldest - self.next;
                self.next = oldest;
            }

            if let Some(frame) = self.shared.read_slot(self.next) {
                self.next += 1;
                return Some(frame);
            }

            // Overwritten between the cursor load and the slot read; the
            // writer publishes the new cursor right after the slot.
            std::hint::spin_loop();
        }
    }

    /// Wait for the next committed frame
    ///
    /// Returns [`Error::Cancelled`] once `cancel` fires and
    /// [`Error::TrackClosed`] when the writer is gone and every committed
    /// frame has been read.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Arc<AVFrame>> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(frame) = self.try_next() {
                return Ok(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(Error::TrackClosed);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::TrackClosed);
                    }
                }
            }
        }
    }

    /// Sequence number of the next frame this cursor will yield
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Frames lost to overwrite so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
