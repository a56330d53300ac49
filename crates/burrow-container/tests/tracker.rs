//! Process tracker behaviour against real children.
//!
//! Own test binary: the tracker's reaper owns `wait4(-1)` for the
//! process, so these cases serialize and never share a process with
//! tests that wait on children themselves.

use burrow_container::tracker::{ProcessTracker, SignallerSpec, StdProcessTracker};
use burrow_container::ContainerError;
use burrow_schema::types::ProcessIo;
use burrow_system::reaper::system_wait4;
use burrow_system::{Cmd, CommandRunner, ProcessReaper, RealCommandRunner};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

fn serial() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    fn wait_for(&self, expected: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let contents = self.contents();
            if contents == expected || Instant::now() > deadline {
                return contents;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn tracker(reaper: Arc<ProcessReaper>) -> StdProcessTracker {
    StdProcessTracker::new(
        PathBuf::from("/depot/some-id"),
        reaper,
        Arc::new(RealCommandRunner::new()) as Arc<dyn CommandRunner>,
    )
}

#[test]
fn runs_a_command_and_delivers_stdio_and_exit_status() {
    let _serial = serial();
    let reaper = Arc::new(ProcessReaper::start(system_wait4()).unwrap());
    let tracker = tracker(Arc::clone(&reaper));

    let stdout = SharedBuffer::default();
    let stderr = SharedBuffer::default();
    let process = tracker
        .run(
            1,
            Cmd::new("sh").args(["-c", "echo hi out; echo hi err >&2; exit 7"]),
            ProcessIo {
                stdin: None,
                stdout: Some(Box::new(stdout.clone())),
                stderr: Some(Box::new(stderr.clone())),
            },
            SignallerSpec::Link,
        )
        .unwrap();

    assert_eq!(process.id(), 1);
    assert_eq!(process.wait().unwrap(), 7);
    assert_eq!(stdout.wait_for("hi out\n"), "hi out\n");
    assert_eq!(stderr.wait_for("hi err\n"), "hi err\n");

    reaper.stop();
}

#[test]
fn feeds_stdin_to_the_process() {
    let _serial = serial();
    let reaper = Arc::new(ProcessReaper::start(system_wait4()).unwrap());
    let tracker = tracker(Arc::clone(&reaper));

    let stdout = SharedBuffer::default();
    let process = tracker
        .run(
            1,
            Cmd::new("cat"),
            ProcessIo {
                stdin: Some(Box::new(std::io::Cursor::new(b"through".to_vec()))),
                stdout: Some(Box::new(stdout.clone())),
                stderr: None,
            },
            SignallerSpec::Link,
        )
        .unwrap();

    assert_eq!(process.wait().unwrap(), 0);
    assert_eq!(stdout.wait_for("through"), "through");

    reaper.stop();
}

#[test]
fn attach_fans_out_to_additional_sinks() {
    let _serial = serial();
    let reaper = Arc::new(ProcessReaper::start(system_wait4()).unwrap());
    let tracker = tracker(Arc::clone(&reaper));

    let late = SharedBuffer::default();
    let process = tracker
        .run(
            3,
            Cmd::new("sh").args(["-c", "sleep 0.3; echo tail"]),
            ProcessIo::default(),
            SignallerSpec::Link,
        )
        .unwrap();

    let attached = tracker
        .attach(
            3,
            ProcessIo {
                stdin: None,
                stdout: Some(Box::new(late.clone())),
                stderr: None,
            },
        )
        .unwrap();
    assert_eq!(attached.id(), 3);

    assert_eq!(process.wait().unwrap(), 0);
    assert_eq!(late.wait_for("tail\n"), "tail\n");

    reaper.stop();
}

#[test]
fn attaching_to_an_unknown_process_fails() {
    let _serial = serial();
    let reaper = Arc::new(ProcessReaper::start(system_wait4()).unwrap());
    let tracker = tracker(Arc::clone(&reaper));

    assert!(matches!(
        tracker.attach(42, ProcessIo::default()),
        Err(ContainerError::ProcessNotFound(42))
    ));

    reaper.stop();
}

#[test]
fn active_process_ids_reflect_running_children() {
    let _serial = serial();
    let reaper = Arc::new(ProcessReaper::start(system_wait4()).unwrap());
    let tracker = tracker(Arc::clone(&reaper));

    let process = tracker
        .run(
            7,
            Cmd::new("sh").args(["-c", "sleep 0.2"]),
            ProcessIo::default(),
            SignallerSpec::Link,
        )
        .unwrap();

    assert_eq!(tracker.active_process_ids(), vec![7]);
    assert_eq!(process.wait().unwrap(), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !tracker.active_process_ids().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(tracker.active_process_ids().is_empty());

    reaper.stop();
}
