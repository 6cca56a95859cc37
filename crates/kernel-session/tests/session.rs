//! Session behavior against a scripted in-memory kernel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use kernel_session::{
    ContentFormat, ContentType, EventCallback, ExecutionEvent, KernelBackend, KernelMessage,
    MsgType, Session, SessionError, SessionOptions,
};
use serde_json::json;

type Script = dyn Fn(&str, &mut HashMap<String, String>) -> Vec<KernelMessage> + Send + Sync;

/// A kernel that answers each cell from a script. Cells starting with
/// `sleep` never go idle on their own; an interrupt ends them with a
/// `KeyboardInterrupt` the way ipykernel does.
struct FakeKernel {
    script: Box<Script>,
    vars: Mutex<HashMap<String, String>>,
    iopub: Mutex<VecDeque<KernelMessage>>,
    hanging: Mutex<Option<String>>,
    fail_recv: AtomicBool,
    next_id: AtomicUsize,
    executes: AtomicUsize,
    interrupts: AtomicUsize,
    restarts: AtomicUsize,
    shutdowns: AtomicUsize,
    readies: AtomicUsize,
}

impl FakeKernel {
    fn new(
        script: impl Fn(&str, &mut HashMap<String, String>) -> Vec<KernelMessage>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            vars: Mutex::new(HashMap::new()),
            iopub: Mutex::new(VecDeque::new()),
            hanging: Mutex::new(None),
            fail_recv: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            readies: AtomicUsize::new(0),
        })
    }

    fn python() -> Arc<Self> {
        Self::new(python_like)
    }

    fn publish(&self, message: KernelMessage) {
        self.iopub.lock().unwrap().push_back(message);
    }
}

impl KernelBackend for FakeKernel {
    fn execute(&self, code: &str, _stop_on_error: bool) -> Result<String> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let msg_id = format!("execute-{}", self.next_id.fetch_add(1, Ordering::SeqCst));

        self.publish(KernelMessage::status("busy").with_parent(&msg_id));
        let outputs = (self.script)(code, &mut self.vars.lock().unwrap());
        for message in outputs {
            let message = if message.parent_msg_id.is_some() {
                message
            } else {
                message.with_parent(&msg_id)
            };
            self.publish(message);
        }

        if code.starts_with("sleep") {
            *self.hanging.lock().unwrap() = Some(msg_id.clone());
        } else {
            self.publish(KernelMessage::status("idle").with_parent(&msg_id));
        }
        Ok(msg_id)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<KernelMessage>> {
        if self.fail_recv.load(Ordering::SeqCst) {
            bail!("socket closed");
        }
        if let Some(message) = self.iopub.lock().unwrap().pop_front() {
            return Ok(Some(message));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }

    fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if let Some(msg_id) = self.hanging.lock().unwrap().take() {
            self.publish(
                KernelMessage::error("KeyboardInterrupt", "", &["KeyboardInterrupt"])
                    .with_parent(&msg_id),
            );
            self.publish(KernelMessage::status("idle").with_parent(&msg_id));
        }
        Ok(())
    }

    fn wait_for_ready(&self) -> Result<()> {
        self.readies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.vars.lock().unwrap().clear();
        self.iopub.lock().unwrap().clear();
        *self.hanging.lock().unwrap() = None;
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Just enough Python: `name = value`, `print(name)`, `1/0` and a few canned
/// cells.
fn python_like(code: &str, vars: &mut HashMap<String, String>) -> Vec<KernelMessage> {
    if let Some((name, value)) = code.split_once('=') {
        vars.insert(name.trim().to_string(), value.trim().to_string());
        return vec![];
    }

    if let Some(name) = code
        .strip_prefix("print(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return match vars.get(name) {
            Some(value) => vec![KernelMessage::stream("stdout", &format!("{}\n", value))],
            None => vec![KernelMessage::error(
                "NameError",
                &format!("name '{}' is not defined", name),
                &[
                    "\u{1b}[0;31m---------------------------------------------------------------------------\u{1b}[0m",
                    &format!("\u{1b}[0;31mNameError\u{1b}[0m: name '{}' is not defined", name),
                ],
            )],
        };
    }

    match code {
        "1/0" => vec![KernelMessage::error(
            "ZeroDivisionError",
            "division by zero",
            &[
                "\u{1b}[0;31mZeroDivisionError\u{1b}[0m                         Traceback (most recent call last)",
                "\u{1b}[0;31mZeroDivisionError\u{1b}[0m: division by zero",
            ],
        )],
        "plot()" => vec![KernelMessage::display_data(json!({
            "image/png": "iVBORw0KGgo=",
            "text/plain": "<Figure size 640x480 with 1 Axes>"
        }))],
        "mixed()" => vec![
            KernelMessage::stream("stdout", "first\n"),
            KernelMessage::display_data(json!({ "text/html": "<b>table</b>" })),
            KernelMessage::stream("stderr", "warning\n"),
            KernelMessage::execute_result(json!({ "text/plain": "42" }), 3),
            KernelMessage::error("ValueError", "bad", &["ValueError: bad"]),
        ],
        "stale()" => vec![
            KernelMessage::stream("stdout", "ghost\n").with_parent("execute-old"),
            KernelMessage::status("idle").with_parent("execute-old"),
            KernelMessage::stream("stdout", "fresh\n"),
        ],
        _ => vec![],
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        poll_interval: Duration::from_millis(10),
        ..SessionOptions::default()
    }
}

fn session(kernel: &Arc<FakeKernel>, options: SessionOptions) -> Session {
    Session::with_backend(kernel.clone(), options).unwrap()
}

#[test]
fn test_with_backend_waits_for_ready() {
    let kernel = FakeKernel::python();
    let _session = session(&kernel, options());
    assert_eq!(kernel.readies.load(Ordering::SeqCst), 1);
}

#[test]
fn test_events_arrive_in_kernel_order() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let events: Vec<ExecutionEvent> = session
        .stream_cell("mixed()", None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let kinds: Vec<(MsgType, ContentFormat, &str)> = events
        .iter()
        .map(|e| (e.msg_type(), e.content_format(), e.content()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (MsgType::Stream, ContentFormat::Output, "first\n"),
            (MsgType::DisplayData, ContentFormat::Html, "<b>table</b>"),
            (MsgType::Stream, ContentFormat::Output, "warning\n"),
            (MsgType::ExecuteResult, ContentFormat::Output, "42"),
            (MsgType::Error, ContentFormat::Output, "ValueError: bad"),
        ]
    );
}

#[test]
fn test_run_cell_aggregates() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let result = session.run_cell("mixed()", None).unwrap();
    assert_eq!(result.events.len(), 5);
    assert!(result.error);
    assert!(result.images.is_empty());
    assert_eq!(
        result.text,
        "first\n<b>table</b>warning\n42ValueError: bad"
    );

    let result = session.run_cell("plot()", None).unwrap();
    assert_eq!(result.events.len(), 1);
    assert_eq!(result.events[0].content_type(), ContentType::Image);
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].mime_type(), "image/png");
    assert_eq!(result.text, "");
    assert!(!result.error);
}

#[test]
fn test_state_persists_between_cells() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    session.run_cell("x = 41", None).unwrap();
    let result = session.run_cell("print(x)", None).unwrap();
    assert_eq!(result.text, "41\n");
    assert!(!result.error);
}

#[test]
fn test_error_traceback_is_plain_text() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let result = session.run_cell("1/0", None).unwrap();
    assert!(result.error);
    assert!(!result.text.contains('\u{1b}'));
    assert!(result
        .text
        .ends_with("\nZeroDivisionError: division by zero"));
}

#[test]
fn test_timeout_interrupts_kernel() {
    let kernel = FakeKernel::python();
    let session = session(
        &kernel,
        SessionOptions {
            timeout: Some(Duration::from_millis(50)),
            ..options()
        },
    );

    let started = Instant::now();
    let mut stream = session.stream_cell("sleep(5)", None).unwrap();
    match stream.next() {
        Some(Err(SessionError::Timeout(after))) => {
            assert_eq!(after, Duration::from_millis(50))
        }
        other => panic!("expected timeout, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(stream.next().is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 1);

    // The interrupted cell's KeyboardInterrupt must not leak into the next one.
    session.run_cell("y = 2", None).unwrap();
    let result = session.run_cell("print(y)", None).unwrap();
    assert_eq!(result.text, "2\n");
    assert!(!result.error);
}

#[test]
fn test_call_timeout_overrides_default() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let err = session
        .run_cell("sleep(5)", Some(Duration::from_millis(30)))
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout(d) if d == Duration::from_millis(30)));
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unrepresentable_timeout_means_no_deadline() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    session.run_cell("x = 4", Some(Duration::MAX)).unwrap();
    let result = session.run_cell("print(x)", Some(Duration::MAX)).unwrap();
    assert_eq!(result.text, "4\n");

    // A hanging cell keeps running until stopped; nothing times it out.
    let stream = session.stream_cell("sleep(5)", Some(Duration::MAX)).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(matches!(
        session.stream_cell("print(x)", None),
        Err(SessionError::Busy)
    ));
    session.stop_execution();
    drop(stream);
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 1);

    let result = session.run_cell("print(x)", None).unwrap();
    assert_eq!(result.text, "4\n");
}

#[test]
fn test_closed_session_rejects_without_touching_kernel() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    session.close().unwrap();
    assert!(session.is_closed());
    assert!(matches!(
        session.run_cell("1+1", None),
        Err(SessionError::Closed)
    ));
    assert!(matches!(
        session.stream_cell("1+1", None),
        Err(SessionError::Closed)
    ));
    assert!(matches!(session.restart(), Err(SessionError::Closed)));
    assert_eq!(kernel.executes.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.restarts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_restart_clears_state() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    session.run_cell("x = 1", None).unwrap();
    session.restart().unwrap();
    assert_eq!(kernel.restarts.load(Ordering::SeqCst), 1);

    let result = session.run_cell("print(x)", None).unwrap();
    assert!(result.error);
    assert_eq!(result.events[0].msg_type(), MsgType::Error);
    assert!(result.text.contains("NameError: name 'x' is not defined"));
}

#[test]
fn test_callback_runs_before_each_event_is_yielded() {
    let kernel = FakeKernel::python();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: EventCallback = Arc::new(move |event: &ExecutionEvent| -> Result<()> {
        sink.lock().unwrap().push(event.content().to_string());
        Ok(())
    });
    let session = session(
        &kernel,
        SessionOptions {
            callback: Some(callback),
            ..options()
        },
    );

    let mut yielded = Vec::new();
    for event in session.stream_cell("mixed()", None).unwrap() {
        let event = event.unwrap();
        // The callback has already seen this event.
        assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some(event.content()));
        yielded.push(event.content().to_string());
    }
    assert_eq!(*seen.lock().unwrap(), yielded);
}

#[test]
fn test_callback_failure_ends_the_run() {
    let kernel = FakeKernel::python();
    let callback: EventCallback = Arc::new(|event: &ExecutionEvent| -> Result<()> {
        if event.msg_type() == MsgType::DisplayData {
            bail!("renderer crashed");
        }
        Ok(())
    });
    let session = session(
        &kernel,
        SessionOptions {
            callback: Some(callback),
            ..options()
        },
    );

    match session.run_cell("mixed()", None) {
        Err(SessionError::Callback(e)) => assert_eq!(e.to_string(), "renderer crashed"),
        other => panic!("expected callback error, got {:?}", other.map(|r| r.text)),
    }

    session.stop_execution();
    let result = session.run_cell("x = 3", None).unwrap();
    assert!(result.events.is_empty());
}

#[test]
fn test_concurrent_submission_is_rejected() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let _running = session.stream_cell("sleep(5)", None).unwrap();
    assert!(matches!(
        session.stream_cell("print(x)", None),
        Err(SessionError::Busy)
    ));
    assert_eq!(kernel.executes.load(Ordering::SeqCst), 1);

    session.stop_execution();
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 1);
    session.run_cell("z = 9", None).unwrap();
}

#[test]
fn test_stop_execution_interrupts_from_another_thread() {
    let kernel = FakeKernel::python();
    let session = Arc::new(session(&kernel, options()));

    let stream = session.stream_cell("sleep(5)", None).unwrap();
    let stopper = {
        let session = session.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            session.stop_execution();
        })
    };

    // Events queued before the stop are still delivered, then the stream ends.
    let events: Vec<_> = stream.collect::<Result<_, _>>().unwrap();
    stopper.join().unwrap();
    assert!(events.len() <= 1);
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_and_close_are_idempotent() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    session.stop_execution();
    session.stop_execution();
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 0);

    session.run_cell("x = 1", None).unwrap();
    session.stop_execution();
    assert_eq!(kernel.interrupts.load(Ordering::SeqCst), 0);

    session.close().unwrap();
    session.close().unwrap();
    session.stop_execution();
    assert_eq!(kernel.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_shuts_kernel_down() {
    let kernel = FakeKernel::python();
    drop(session(&kernel, options()));
    assert_eq!(kernel.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transport_failure_surfaces() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    kernel.fail_recv.store(true, Ordering::SeqCst);
    match session.run_cell("print(x)", None) {
        Err(SessionError::Transport(e)) => assert_eq!(e.to_string(), "socket closed"),
        other => panic!("expected transport error, got {:?}", other.map(|r| r.text)),
    }
}

#[test]
fn test_output_of_other_requests_is_skipped() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let result = session.run_cell("stale()", None).unwrap();
    assert_eq!(result.text, "fresh\n");
    assert_eq!(result.events.len(), 1);
}

#[test]
fn test_abandoned_stream_does_not_block_next_cell() {
    let kernel = FakeKernel::python();
    let session = session(&kernel, options());

    let mut stream = session.stream_cell("mixed()", None).unwrap();
    assert!(stream.next().unwrap().is_ok());
    drop(stream);

    // The listener keeps draining to idle on its own.
    let deadline = Instant::now() + Duration::from_secs(2);
    let result = loop {
        match session.run_cell("print(x)", None) {
            Err(SessionError::Busy) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10))
            }
            other => break other,
        }
    };
    assert!(result.unwrap().error);
}
