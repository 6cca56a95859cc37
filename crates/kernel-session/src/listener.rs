//! Background listener for one cell execution.
//!
//! The listener drains the kernel's broadcast channel on its own thread,
//! classifies each notification belonging to the submitted request, and
//! pushes the resulting events onto the run's queue. It stops when the
//! kernel reports idle, when the run is marked finished by the controller,
//! or when the cell deadline passes (in which case it interrupts the kernel).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, error, warn};

use crate::backend::KernelBackend;
use crate::classify::{classify, Classification};
use crate::output::Record;

/// Everything the listener thread needs for one run.
pub(crate) struct Listener {
    pub kernel: Arc<dyn KernelBackend>,
    /// `msg_id` of the execute request; other traffic is skipped.
    pub msg_id: String,
    pub started: Instant,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub finished: Arc<AtomicBool>,
    pub tx: Sender<Record>,
}

impl Listener {
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("iopub-listener".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        // A timeout too large to represent as an instant means no deadline.
        let deadline = self
            .timeout
            .and_then(|timeout| {
                self.started
                    .checked_add(timeout)
                    .map(|deadline| (deadline, timeout))
            });

        while !self.finished.load(Ordering::Acquire) {
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    warn!(
                        "[listener] Cell {} exceeded {}ms, interrupting kernel",
                        self.msg_id,
                        timeout.as_millis()
                    );
                    let _ = self.tx.send(Record::TimedOut(timeout));
                    self.finished.store(true, Ordering::Release);
                    if let Err(e) = self.kernel.interrupt() {
                        error!("[listener] Failed to interrupt kernel: {:#}", e);
                    }
                    break;
                }
            }

            let message = match self.kernel.recv(self.poll_interval) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!("[listener] iopub receive failed: {:#}", e);
                    let _ = self.tx.send(Record::Failed(e));
                    self.finished.store(true, Ordering::Release);
                    break;
                }
            };

            if !message.is_child_of(&self.msg_id) {
                debug!(
                    "[listener] Skipping {} for parent {:?}",
                    message.msg_type, message.parent_msg_id
                );
                continue;
            }

            match classify(&message) {
                Classification::Done => {
                    debug!("[listener] Cell {} finished", self.msg_id);
                    self.finished.store(true, Ordering::Release);
                    break;
                }
                Classification::Event(event) => {
                    // The consumer may have dropped the stream; keep draining
                    // until idle so the kernel's state stays in step.
                    let _ = self.tx.send(Record::Event(event));
                }
                Classification::Ignored => {}
            }
        }
    }
}
