//! Stateful, event-streaming execution sessions over a Jupyter kernel.
//!
//! A [`Session`] owns one kernel. Each submitted cell gets its own listener
//! thread that drains the kernel's iopub channel, classifies every message
//! belonging to that cell into an [`ExecutionEvent`], and hands the events
//! to the caller through an [`OutputStream`] in arrival order.
//!
//! ```no_run
//! use kernel_session::{Session, SessionConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), kernel_session::SessionError> {
//! let session = Session::local(SessionConfig::from_env())?;
//!
//! for event in session.stream_cell("print('hi')", Some(Duration::from_secs(5)))? {
//!     let event = event?;
//!     println!("{}: {}", event.msg_type(), event.content());
//! }
//!
//! let result = session.run_cell("1/0", None)?;
//! assert!(result.error);
//! session.close()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod classify;
pub mod config;
pub mod error;
pub mod event;
mod listener;
pub mod local;
pub mod output;
pub mod session;

pub use backend::{KernelBackend, KernelMessage};
pub use classify::{classify, strip_ansi, Classification};
pub use config::{validate_executable, SessionConfig, SessionOptions};
pub use error::SessionError;
pub use event::{
    Base64Image, CodeFormat, ContentFormat, ContentType, ExecutionEvent, ExecutionResult,
    ImageFormat, MsgType,
};
pub use local::{InterruptMode, KernelCommand, LaunchSpec, LocalKernel};
pub use output::{EventCallback, OutputStream};
pub use session::Session;
