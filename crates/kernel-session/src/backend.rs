//! The narrow interface a session needs from a running kernel.
//!
//! A [`KernelBackend`] hides process spawning and the wire transport. The
//! session only submits code, polls broadcast (iopub) notifications, and
//! asks for interrupts, restarts and shutdown.

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

/// One raw notification from the kernel's broadcast channel.
///
/// `content` is the Jupyter wire-format content for `msg_type`, e.g.
/// `{"name": "stdout", "text": "hi\n"}` for a `stream` message.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    pub msg_type: String,
    /// `msg_id` of the request that caused this message, if any.
    pub parent_msg_id: Option<String>,
    pub content: Value,
}

impl KernelMessage {
    pub fn new(msg_type: impl Into<String>, content: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            parent_msg_id: None,
            content,
        }
    }

    pub fn with_parent(mut self, msg_id: impl Into<String>) -> Self {
        self.parent_msg_id = Some(msg_id.into());
        self
    }

    pub fn status(execution_state: &str) -> Self {
        Self::new("status", json!({ "execution_state": execution_state }))
    }

    pub fn stream(name: &str, text: &str) -> Self {
        Self::new("stream", json!({ "name": name, "text": text }))
    }

    pub fn error(ename: &str, evalue: &str, traceback: &[&str]) -> Self {
        Self::new(
            "error",
            json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
        )
    }

    /// A `display_data` message; `data` is the mime-type keyed bundle.
    pub fn display_data(data: Value) -> Self {
        Self::new("display_data", json!({ "data": data, "metadata": {} }))
    }

    pub fn execute_result(data: Value, execution_count: u32) -> Self {
        Self::new(
            "execute_result",
            json!({ "data": data, "metadata": {}, "execution_count": execution_count }),
        )
    }

    pub fn is_child_of(&self, msg_id: &str) -> bool {
        self.parent_msg_id.as_deref() == Some(msg_id)
    }
}

/// Capabilities a session requires from a kernel.
///
/// Methods block the calling thread. `recv` is called from the listener
/// thread while the controller may concurrently call `interrupt`, so
/// implementations use interior mutability.
pub trait KernelBackend: Send + Sync {
    /// Submit `code` for execution and return the request's `msg_id`.
    fn execute(&self, code: &str, stop_on_error: bool) -> Result<String>;

    /// Receive the next broadcast notification, or `None` if nothing arrived
    /// within `timeout`.
    fn recv(&self, timeout: Duration) -> Result<Option<KernelMessage>>;

    /// Ask the kernel to abort the running execution.
    fn interrupt(&self) -> Result<()>;

    /// Block until the kernel answers requests.
    fn wait_for_ready(&self) -> Result<()>;

    /// Tear the kernel down and launch it again, blocking until ready.
    fn restart(&self) -> Result<()>;

    /// Close channels and stop the kernel process.
    fn shutdown(&self) -> Result<()>;
}
