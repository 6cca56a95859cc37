//! The consumer side of a cell run: a lazy, one-shot sequence of events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::SessionError;
use crate::event::ExecutionEvent;

/// Per-event hook invoked before each event is yielded. An error ends the
/// stream and is returned to the caller as [`SessionError::Callback`].
pub type EventCallback = Arc<dyn Fn(&ExecutionEvent) -> anyhow::Result<()> + Send + Sync>;

/// What the listener puts on the queue.
#[derive(Debug)]
pub(crate) enum Record {
    Event(ExecutionEvent),
    /// The cell deadline elapsed; the kernel has been asked to interrupt.
    TimedOut(Duration),
    /// The kernel transport failed while receiving.
    Failed(anyhow::Error),
}

/// Events of one cell run, in the order the kernel produced them.
///
/// Ends when the run is finished and every queued event has been yielded.
/// The first error (timeout, transport failure, callback failure) is
/// yielded once and then the stream is exhausted.
pub struct OutputStream {
    rx: Receiver<Record>,
    finished: Arc<AtomicBool>,
    callback: Option<EventCallback>,
    poll_interval: Duration,
    done: bool,
}

impl OutputStream {
    pub(crate) fn new(
        rx: Receiver<Record>,
        finished: Arc<AtomicBool>,
        callback: Option<EventCallback>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            rx,
            finished,
            callback,
            poll_interval,
            done: false,
        }
    }

    fn deliver(&mut self, record: Record) -> Result<ExecutionEvent, SessionError> {
        match record {
            Record::Event(event) => {
                if let Some(callback) = &self.callback {
                    callback(&event).map_err(SessionError::Callback)?;
                }
                Ok(event)
            }
            Record::TimedOut(after) => Err(SessionError::Timeout(after)),
            Record::Failed(e) => Err(SessionError::Transport(e)),
        }
    }
}

impl Iterator for OutputStream {
    type Item = Result<ExecutionEvent, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(record) => {
                    let item = self.deliver(record);
                    if item.is_err() {
                        self.done = true;
                    }
                    return Some(item);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // The listener publishes `finished` only after its last
                    // send, so an empty queue here really is the end.
                    if self.finished.load(Ordering::Acquire) && self.rx.is_empty() {
                        self.done = true;
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    if self.finished.load(Ordering::Acquire) {
                        return None;
                    }
                    return Some(Err(SessionError::Transport(anyhow::anyhow!(
                        "listener exited before the cell finished"
                    ))));
                }
            }
        }
    }
}

impl std::iter::FusedIterator for OutputStream {}
