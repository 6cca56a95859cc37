//! The session controller: one kernel, one cell at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::backend::KernelBackend;
use crate::config::{SessionConfig, SessionOptions};
use crate::error::SessionError;
use crate::event::ExecutionResult;
use crate::listener::Listener;
use crate::local::LocalKernel;
use crate::output::OutputStream;

/// The listener of the most recently submitted cell.
struct ActiveRun {
    msg_id: String,
    finished: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

/// A stateful execution session over a single kernel.
///
/// Variables defined by one cell are visible to the next until the session
/// is restarted. All methods take `&self`, so `stop_execution` can be called
/// from another thread while a stream is being consumed.
pub struct Session {
    kernel: Arc<dyn KernelBackend>,
    options: SessionOptions,
    closed: AtomicBool,
    active: StdMutex<Option<ActiveRun>>,
}

impl Session {
    /// Launch a local kernel and block until it is ready.
    pub fn local(config: SessionConfig) -> Result<Self, SessionError> {
        let spec = config.launch_spec()?;
        info!("[session] Launching local kernel: {:?}", spec.command);
        let kernel = LocalKernel::launch(spec)?;
        Ok(Self::from_parts(Arc::new(kernel), config.options))
    }

    /// Wrap an already started backend, waiting for it to report ready.
    pub fn with_backend(
        kernel: Arc<dyn KernelBackend>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        kernel.wait_for_ready()?;
        Ok(Self::from_parts(kernel, options))
    }

    fn from_parts(kernel: Arc<dyn KernelBackend>, options: SessionOptions) -> Self {
        Self {
            kernel,
            options,
            closed: AtomicBool::new(false),
            active: StdMutex::new(None),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit `code` and return its events as they arrive.
    ///
    /// `timeout` overrides the session default for this cell. A timeout is
    /// reported when the returned stream reaches it, after the kernel has
    /// been interrupted.
    pub fn stream_cell(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<OutputStream, SessionError> {
        self.ensure_open()?;

        let mut active = self.lock_active();
        if let Some(run) = active.as_ref() {
            if !run.finished.load(Ordering::Acquire) {
                debug!("[session] Rejecting cell while {} is running", run.msg_id);
                return Err(SessionError::Busy);
            }
        }
        // A finished listener exits within one poll interval.
        if let Some(run) = active.take() {
            join_listener(run);
        }

        let timeout = timeout.or(self.options.timeout);
        let finished = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded();

        let started = Instant::now();
        let msg_id = self.kernel.execute(code, true)?;
        debug!(
            "[session] Submitted cell {} (timeout: {:?})",
            msg_id, timeout
        );

        let listener = Listener {
            kernel: self.kernel.clone(),
            msg_id: msg_id.clone(),
            started,
            timeout,
            poll_interval: self.options.poll_interval,
            finished: finished.clone(),
            tx,
        }
        .spawn();

        let listener = match listener {
            Ok(handle) => handle,
            Err(e) => {
                error!("[session] Failed to spawn listener: {}", e);
                if let Err(e) = self.kernel.interrupt() {
                    warn!("[session] Failed to interrupt orphaned cell: {:#}", e);
                }
                return Err(SessionError::Spawn(e));
            }
        };

        *active = Some(ActiveRun {
            msg_id,
            finished: finished.clone(),
            listener,
        });

        Ok(OutputStream::new(
            rx,
            finished,
            self.options.callback.clone(),
            self.options.poll_interval,
        ))
    }

    /// Run `code` to completion and aggregate its events.
    pub fn run_cell(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, SessionError> {
        let events = self
            .stream_cell(code, timeout)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ExecutionResult::from_events(events))
    }

    /// Stop the running cell, if any, and wait for its listener to exit.
    ///
    /// Safe to call at any time, including after `close`.
    pub fn stop_execution(&self) {
        let Some(run) = self.lock_active().take() else {
            return;
        };

        let was_running = !run.finished.swap(true, Ordering::AcqRel);
        if was_running && !run.listener.is_finished() {
            info!("[session] Interrupting cell {}", run.msg_id);
            if let Err(e) = self.kernel.interrupt() {
                warn!("[session] Failed to interrupt kernel: {:#}", e);
            }
        }
        join_listener(run);
    }

    /// Discard all kernel state by relaunching the kernel.
    pub fn restart(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.stop_execution();
        info!("[session] Restarting kernel");
        self.kernel.restart()?;
        Ok(())
    }

    /// Stop any running cell and shut the kernel down. Later calls are no-ops.
    pub fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("[session] Closing session");
        self.stop_execution();
        self.kernel.shutdown()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        // The guarded value is only ever replaced whole, so a poisoned lock
        // still holds consistent state.
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn join_listener(run: ActiveRun) {
    if run.listener.join().is_err() {
        error!("[session] Listener for {} panicked", run.msg_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("[session] Error closing session on drop: {}", e);
        }
    }
}
