use std::sync::Arc;
use std::time::{Duration, Instant};

use ph_core::config::Config;
use ph_session::session::command_input;
use ph_session::{HistoryBuffer, LaunchSpec, SerialQueue, Session, SessionError};

fn launch(program: &str, args: &[&str]) -> LaunchSpec {
    LaunchSpec {
        program: program.into(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: None,
        env: vec![("TERM".into(), "xterm-256color".into())],
        cols: 80,
        rows: 24,
    }
}

fn spawn(spec: &LaunchSpec) -> (Arc<Session>, Arc<HistoryBuffer>, SerialQueue) {
    let buffer = Arc::new(HistoryBuffer::new(1000));
    let queue = SerialQueue::new("session-test");
    let session = Session::spawn(
        spec,
        buffer.clone(),
        queue.clone(),
        &Config::default(),
        true,
    )
    .expect("spawn");
    (session, buffer, queue)
}

fn wait_for_text(buffer: &HistoryBuffer, queue: &SerialQueue, needle: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        queue.barrier();
        if buffer.text().contains(needle) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn spawn_simple_process() {
    let (session, buffer, queue) = spawn(&launch("/bin/echo", &["hello", "world"]));
    assert!(session.pid() > 0);
    assert!(session.console_mode());
    assert!(
        wait_for_text(&buffer, &queue, "hello world"),
        "got: {:?}",
        buffer.text()
    );
}

#[test]
fn output_lines_arrive_in_order() {
    let (_session, buffer, queue) = spawn(&launch(
        "/bin/sh",
        &["-c", "echo line1; echo line2; echo line3"],
    ));
    assert!(wait_for_text(&buffer, &queue, "line3"));
    let text = buffer.text();
    let (a, b, c) = (
        text.find("line1").unwrap(),
        text.find("line2").unwrap(),
        text.find("line3").unwrap(),
    );
    assert!(a < b && b < c, "out of order: {text:?}");
}

#[test]
fn working_directory_and_env_are_applied() {
    let tmp = tempfile::tempdir().unwrap();
    let mut spec = launch("/bin/sh", &["-c", "pwd; echo \"v=$PH_TEST_VAR\""]);
    spec.cwd = Some(tmp.path().to_path_buf());
    spec.env.push(("PH_TEST_VAR".into(), "xyz".into()));
    let (_session, buffer, queue) = spawn(&spec);
    assert!(wait_for_text(&buffer, &queue, "v=xyz"));
    let dir_name = tmp.path().file_name().unwrap().to_string_lossy().to_string();
    assert!(buffer.text().contains(&dir_name), "got: {:?}", buffer.text());
}

#[test]
fn write_and_read_back_via_cat() {
    let (session, buffer, queue) = spawn(&launch("/bin/cat", &[]));
    session.execute("ping-pong");
    assert!(wait_for_text(&buffer, &queue, "ping-pong"));
    session.terminate(true);
}

#[test]
fn resize_is_visible_to_child() {
    let (session, buffer, queue) = spawn(&launch(
        "/bin/sh",
        &["-c", "sleep 0.5; stty size; sleep 5"],
    ));
    session.resize(132, 50);
    assert!(
        wait_for_text(&buffer, &queue, "50 132"),
        "got: {:?}",
        buffer.text()
    );
    session.terminate(true);
}

#[test]
fn spawn_failure_is_reported() {
    let buffer = Arc::new(HistoryBuffer::new(10));
    let queue = SerialQueue::new("session-test");
    let result = Session::spawn(
        &launch("/no/such/binary", &[]),
        buffer,
        queue,
        &Config::default(),
        false,
    );
    assert!(matches!(result, Err(SessionError::SpawnFailed { .. })));
}

#[test]
fn cooperative_process_exits_gracefully() {
    let (session, _buffer, _queue) = spawn(&launch("/bin/cat", &[]));
    let report = session.terminate(true).expect("report");
    assert!(report.graceful, "report: {report:?}");
    assert!(!report.escalated);
    assert!(report.reaped);
    assert!(!session.is_running());

    // Teardown runs once.
    assert!(session.terminate(true).is_none());
    // Input after teardown is dropped silently.
    session.send(b"ignored");
}

#[test]
fn exit_is_signalled_once() {
    let (session, _buffer, _queue) = spawn(&launch("/bin/sh", &["-c", "exit 7"]));
    let rx = session.take_termination().expect("first take");
    assert!(session.take_termination().is_none());
    let term = rx.recv_timeout(Duration::from_secs(5)).expect("termination");
    assert_eq!(term.pid, session.pid());
    assert_eq!(term.session_id, session.id());
    assert_eq!(term.exit_code, Some(7));
    assert!(!session.is_running());
}

#[test]
fn command_input_appends_single_cr() {
    assert_eq!(command_input("ls\n"), b"ls\r");
}
