//! Locally launched kernels.
//!
//! `LocalKernel` spawns an ipykernel (or any installed kernelspec), connects
//! iopub and shell over ZeroMQ through `runtimelib`, and exposes the blocking
//! [`KernelBackend`] interface on top of a private tokio runtime:
//! - iopub messages are read by a spawned task and forwarded into a
//!   crossbeam channel that `recv` polls with a timeout
//! - shell replies are routed back to waiting requests by parent `msg_id`
//! - the process runs in its own process group so interrupts and cleanup
//!   reach the whole kernel tree

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backend::{KernelBackend, KernelMessage};
use crate::config::DEFAULT_READY_TIMEOUT;

/// How long iopub must stay quiet after the handshake before it is considered
/// drained.
const IOPUB_SETTLE: Duration = Duration::from_millis(200);

/// How long a kernel gets to exit after a shutdown request before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCommand {
    /// `<python> -m ipykernel_launcher -f <connection file>`
    Python(PathBuf),
    /// An installed kernelspec, resolved with `runtimelib::find_kernelspec`.
    Kernelspec(String),
}

/// How interrupts are delivered to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// SIGINT to the kernel's process group.
    Signal,
    /// `interrupt_request` on the control channel.
    Message,
}

impl Default for InterruptMode {
    fn default() -> Self {
        if cfg!(unix) {
            InterruptMode::Signal
        } else {
            InterruptMode::Message
        }
    }
}

/// Everything needed to (re)launch a local kernel.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: KernelCommand,
    /// Extra environment for the kernel process only.
    pub env: Vec<(String, String)>,
    /// Defaults to the home directory.
    pub working_dir: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub interrupt_mode: InterruptMode,
}

impl LaunchSpec {
    pub fn new(command: KernelCommand) -> Self {
        Self {
            command,
            // Silences debugpy's frozen-modules warning in kernel stderr.
            env: vec![(
                "PYDEVD_DISABLE_FILE_VALIDATION".to_string(),
                "1".to_string(),
            )],
            working_dir: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            interrupt_mode: InterruptMode::default(),
        }
    }

    pub fn python(path: impl Into<PathBuf>) -> Self {
        Self::new(KernelCommand::Python(path.into()))
    }

    pub fn kernelspec(name: impl Into<String>) -> Self {
        Self::new(KernelCommand::Kernelspec(name.into()))
    }

    fn kernel_name(&self) -> &str {
        match &self.command {
            KernelCommand::Python(_) => "python3",
            KernelCommand::Kernelspec(name) => name,
        }
    }
}

/// Shell requests waiting for their reply: msg_id → reply sender.
type PendingReplies = Arc<StdMutex<HashMap<String, oneshot::Sender<JupyterMessage>>>>;

/// A running kernel process and its open channels.
struct RunningKernel {
    kernel_id: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    session_id: String,
    process: tokio::process::Child,
    #[cfg(unix)]
    process_group_id: Option<i32>,
    shell_writer: runtimelib::DealerSendConnection,
    iopub_task: tokio::task::JoinHandle<()>,
    shell_reader_task: tokio::task::JoinHandle<()>,
    pending_replies: PendingReplies,
    iopub_rx: Receiver<Result<KernelMessage>>,
}

impl RunningKernel {
    async fn launch(spec: &LaunchSpec) -> Result<Self> {
        let kernel_name = spec.kernel_name().to_string();

        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernel_name.clone()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("cellrun-kernel-{}.json", kernel_id));

        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        let result =
            Self::start(spec, kernel_id, connection_info, connection_file.clone()).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&connection_file).await;
        }
        result
    }

    async fn start(
        spec: &LaunchSpec,
        kernel_id: String,
        connection_info: ConnectionInfo,
        connection_file: PathBuf,
    ) -> Result<Self> {
        let mut cmd = match &spec.command {
            KernelCommand::Python(python) => {
                info!("[local-kernel] Starting Python kernel with {:?}", python);
                let mut c = tokio::process::Command::new(python);
                c.args(["-m", "ipykernel_launcher", "-f"]);
                c.arg(&connection_file);
                c.stdout(Stdio::null());
                c.stderr(Stdio::null());
                c
            }
            KernelCommand::Kernelspec(name) => {
                info!("[local-kernel] Starting {} kernel via kernelspec", name);
                let kernelspec = runtimelib::find_kernelspec(name).await?;
                kernelspec.command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))?
            }
        };

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let cwd = spec
            .working_dir
            .clone()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(std::env::temp_dir));
        cmd.current_dir(&cwd);

        #[cfg(unix)]
        cmd.process_group(0);

        let process = cmd
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn kernel {}", kernel_id))?;

        #[cfg(unix)]
        let process_group_id = process.id().map(|pid| pid as i32);

        let session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;

        let (iopub_tx, iopub_rx) = crossbeam_channel::unbounded();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        debug!(
                            "[local-kernel] iopub: type={} parent_msg_id={:?}",
                            message.header.msg_type,
                            message.parent_header.as_ref().map(|h| &h.msg_id)
                        );
                        if iopub_tx.send(Ok(kernel_message(&message))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[local-kernel] iopub read error: {}", e);
                        let _ = iopub_tx.send(Err(anyhow!("iopub read error: {}", e)));
                        break;
                    }
                }
            }
        });

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;
        let (shell_writer, mut shell_reader) = shell.split();

        let pending_replies: PendingReplies = Arc::new(StdMutex::new(HashMap::new()));
        let pending = pending_replies.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        let waiter = msg
                            .parent_header
                            .as_ref()
                            .and_then(|h| pending.lock().ok()?.remove(&h.msg_id));
                        match waiter {
                            Some(sender) => {
                                let _ = sender.send(msg);
                            }
                            None => {
                                debug!("[local-kernel] shell reply: type={}", msg.header.msg_type);
                            }
                        }
                    }
                    Err(e) => {
                        error!("[local-kernel] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        let mut kernel = RunningKernel {
            kernel_id,
            connection_info,
            connection_file,
            session_id,
            process,
            #[cfg(unix)]
            process_group_id,
            shell_writer,
            iopub_task,
            shell_reader_task,
            pending_replies,
            iopub_rx,
        };

        // On failure `kernel` is dropped, which kills the process group.
        kernel.wait_for_ready(spec.ready_timeout).await?;
        info!("[local-kernel] Kernel started: {}", kernel.kernel_id);
        Ok(kernel)
    }

    /// Round-trip a `kernel_info_request` on the shell channel.
    async fn wait_for_ready(&mut self, timeout: Duration) -> Result<()> {
        let request: JupyterMessage = KernelInfoRequest::default().into();
        let msg_id = request.header.msg_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending_replies
            .lock()
            .map_err(|_| anyhow!("Lock poisoned"))?
            .insert(msg_id.clone(), tx);

        self.shell_writer.send(request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                info!(
                    "[local-kernel] Kernel {} alive: got {} reply",
                    self.kernel_id, reply.header.msg_type
                );
                Ok(())
            }
            Ok(Err(_)) => Err(anyhow!("Shell reader dropped before kernel_info_reply")),
            Err(_) => {
                if let Ok(mut pending) = self.pending_replies.lock() {
                    pending.remove(&msg_id);
                }
                if let Ok(Some(status)) = self.process.try_wait() {
                    bail!("Kernel process exited during startup ({})", status);
                }
                bail!("Kernel did not respond within {}s", timeout.as_secs())
            }
        }
    }

    /// Discard iopub traffic left over from startup or the handshake.
    fn drain_iopub(&self) -> Result<()> {
        loop {
            match self.iopub_rx.recv_timeout(IOPUB_SETTLE) {
                Ok(Ok(message)) => {
                    debug!("[local-kernel] Drained stale {}", message.msg_type);
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => bail!("iopub channel closed"),
            }
        }
    }

    async fn execute(&mut self, code: &str, stop_on_error: bool) -> Result<String> {
        let mut request = ExecuteRequest::new(code.to_string());
        request.stop_on_error = stop_on_error;
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        self.shell_writer.send(message).await?;
        info!("[local-kernel] Sent execute_request: msg_id={}", msg_id);
        Ok(msg_id)
    }

    async fn interrupt_request(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;

        let request: JupyterMessage = InterruptRequest {}.into();
        control.send(request).await?;

        info!("[local-kernel] Sent interrupt_request");
        Ok(())
    }

    #[cfg(unix)]
    fn signal_interrupt(&self) -> Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = self
            .process_group_id
            .ok_or_else(|| anyhow!("Kernel process has no process group"))?;
        killpg(Pid::from_raw(pgid), Signal::SIGINT)
            .with_context(|| format!("Failed to signal process group {}", pgid))?;
        info!("[local-kernel] Sent SIGINT to process group {}", pgid);
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal_interrupt(&self) -> Result<()> {
        bail!("Signal interrupts are only supported on unix; use InterruptMode::Message")
    }

    /// Ask the kernel to exit, give it a moment, then let `Drop` kill
    /// whatever is left and remove the connection file.
    async fn shutdown(mut self) {
        info!("[local-kernel] Shutting down kernel {}", self.kernel_id);

        self.iopub_task.abort();
        self.shell_reader_task.abort();

        match runtimelib::create_client_control_connection(
            &self.connection_info,
            &self.session_id,
        )
        .await
        {
            Ok(mut control) => {
                let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                if let Err(e) = control.send(request).await {
                    warn!("[local-kernel] Failed to send shutdown_request: {}", e);
                }
            }
            Err(e) => warn!("[local-kernel] Failed to open control channel: {}", e),
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.process.wait()).await {
            Ok(Ok(status)) => debug!("[local-kernel] Kernel exited with {}", status),
            Ok(Err(e)) => warn!("[local-kernel] Failed to wait for kernel: {}", e),
            Err(_) => warn!(
                "[local-kernel] Kernel {} ignored shutdown_request, killing",
                self.kernel_id
            ),
        }
    }
}

impl Drop for RunningKernel {
    fn drop(&mut self) {
        self.iopub_task.abort();
        self.shell_reader_task.abort();

        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!(
                        "[local-kernel] Failed to kill process group {}: {}",
                        pgid, e
                    );
                }
            }
        }

        let _ = std::fs::remove_file(&self.connection_file);
        debug!("[local-kernel] Kernel {} resources cleaned up", self.kernel_id);
    }
}

/// Flatten a decoded Jupyter message into the wire-format content the
/// classifier reads.
pub(crate) fn kernel_message(message: &JupyterMessage) -> KernelMessage {
    let content = match &message.content {
        JupyterMessageContent::Status(status) => {
            let state = match status.execution_state {
                jupyter_protocol::ExecutionState::Busy => "busy",
                jupyter_protocol::ExecutionState::Idle => "idle",
                jupyter_protocol::ExecutionState::Starting => "starting",
                jupyter_protocol::ExecutionState::Restarting => "restarting",
                jupyter_protocol::ExecutionState::Terminating => "terminating",
                jupyter_protocol::ExecutionState::Dead => "dead",
                _ => "unknown",
            };
            json!({ "execution_state": state })
        }
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            json!({ "name": name, "text": stream.text })
        }
        JupyterMessageContent::DisplayData(data) => json!({ "data": data.data }),
        JupyterMessageContent::ExecuteResult(result) => json!({
            "data": result.data,
            "execution_count": result.execution_count.0
        }),
        JupyterMessageContent::ErrorOutput(error) => json!({
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        }),
        _ => Value::Null,
    };

    KernelMessage {
        msg_type: message.header.msg_type.clone(),
        parent_msg_id: message.parent_header.as_ref().map(|h| h.msg_id.clone()),
        content,
    }
}

/// A kernel process on this machine.
pub struct LocalKernel {
    // Declared before `runtime` so the kernel is torn down first on drop.
    kernel: StdMutex<Option<RunningKernel>>,
    spec: LaunchSpec,
    runtime: Runtime,
}

impl LocalKernel {
    /// Launch a kernel and block until it answers a `kernel_info_request`.
    pub fn launch(spec: LaunchSpec) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("local-kernel-io")
            .enable_all()
            .build()?;

        let local = Self {
            kernel: StdMutex::new(None),
            spec,
            runtime,
        };
        let kernel = local.start_kernel()?;
        *local.lock_kernel()? = Some(kernel);
        Ok(local)
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Petname of the running kernel, used in its connection file name.
    pub fn kernel_id(&self) -> Option<String> {
        let guard = self.kernel.lock().ok()?;
        guard.as_ref().map(|k| k.kernel_id.clone())
    }

    pub fn connection_file(&self) -> Option<PathBuf> {
        let guard = self.kernel.lock().ok()?;
        guard.as_ref().map(|k| k.connection_file.clone())
    }

    fn start_kernel(&self) -> Result<RunningKernel> {
        let kernel = self.runtime.block_on(RunningKernel::launch(&self.spec))?;
        kernel.drain_iopub()?;
        Ok(kernel)
    }

    fn lock_kernel(&self) -> Result<MutexGuard<'_, Option<RunningKernel>>> {
        self.kernel
            .lock()
            .map_err(|_| anyhow!("Kernel state lock poisoned"))
    }
}

impl KernelBackend for LocalKernel {
    fn execute(&self, code: &str, stop_on_error: bool) -> Result<String> {
        let mut guard = self.lock_kernel()?;
        let kernel = guard
            .as_mut()
            .ok_or_else(|| anyhow!("No kernel running"))?;
        self.runtime.block_on(kernel.execute(code, stop_on_error))
    }

    fn recv(&self, timeout: Duration) -> Result<Option<KernelMessage>> {
        // Clone the receiver so the state lock is not held while blocking.
        let rx = {
            let guard = self.lock_kernel()?;
            guard
                .as_ref()
                .ok_or_else(|| anyhow!("No kernel running"))?
                .iopub_rx
                .clone()
        };

        match rx.recv_timeout(timeout) {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("iopub channel closed")),
        }
    }

    fn interrupt(&self) -> Result<()> {
        let guard = self.lock_kernel()?;
        let kernel = guard
            .as_ref()
            .ok_or_else(|| anyhow!("No kernel running"))?;
        match self.spec.interrupt_mode {
            InterruptMode::Signal => kernel.signal_interrupt(),
            InterruptMode::Message => self.runtime.block_on(kernel.interrupt_request()),
        }
    }

    fn wait_for_ready(&self) -> Result<()> {
        let mut guard = self.lock_kernel()?;
        let kernel = guard
            .as_mut()
            .ok_or_else(|| anyhow!("No kernel running"))?;
        self.runtime
            .block_on(kernel.wait_for_ready(self.spec.ready_timeout))?;
        kernel.drain_iopub()
    }

    fn restart(&self) -> Result<()> {
        let mut guard = self.lock_kernel()?;
        if let Some(old) = guard.take() {
            self.runtime.block_on(old.shutdown());
        }
        let kernel = self.start_kernel()?;
        info!("[local-kernel] Kernel restarted as {}", kernel.kernel_id);
        *guard = Some(kernel);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let kernel = self.lock_kernel()?.take();
        if let Some(kernel) = kernel {
            self.runtime.block_on(kernel.shutdown());
        }
        Ok(())
    }
}
