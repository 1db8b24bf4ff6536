use std::fmt::Display;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::Engine;
use crate::error::ConvertError;
use crate::job::ConversionJob;
use crate::progress::{DisplayUpdate, LineCategory, ProgressState};
use crate::settings::CodecSettings;

/// How long a terminated engine gets to exit on its own before it is killed.
const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub enum JobFailure {
    /// The engine process could not be created for this job.
    Spawn(String),
    /// The engine exited with a nonzero code.
    ExitCode(i32),
    /// The engine was terminated before exiting on its own (cancellation or
    /// an external signal); no exit code is available.
    Terminated,
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::Spawn(msg) => write!(f, "could not start engine: {}", msg),
            JobFailure::ExitCode(code) => write!(f, "engine exited with {}", code),
            JobFailure::Terminated => write!(f, "engine was terminated"),
        }
    }
}

/// Exactly one of these is emitted per enqueued job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    Failed(JobFailure),
    Skipped,
}

#[derive(Clone, Debug)]
pub enum BatchEvent {
    JobStarted {
        index: usize,
        name: String,
    },
    /// One raw diagnostic line from the engine, with its parsed update.
    EngineLine {
        index: usize,
        line: String,
        update: DisplayUpdate,
    },
    JobFinished {
        index: usize,
        outcome: JobOutcome,
    },
    /// Always the last event, emitted exactly once per started batch.
    BatchComplete,
}

/// An ordered set of conversion jobs sharing one settings snapshot, executed
/// strictly sequentially on a supervising thread.
pub struct Batch {
    jobs: Vec<ConversionJob>,
    settings: CodecSettings,
    engine: Engine,
    subscribers: Vec<Sender<BatchEvent>>,
}

impl Batch {
    pub fn new(jobs: Vec<ConversionJob>, settings: CodecSettings, engine: Engine) -> Self {
        Batch {
            jobs,
            settings,
            engine,
            subscribers: vec![],
        }
    }

    pub fn subscribe(&mut self) -> Receiver<BatchEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Probe the engine, then begin asynchronous execution. The probe is
    /// eager so a batch doomed to fail never starts.
    pub fn start(self) -> Result<BatchHandle, ConvertError> {
        self.engine.probe()?;

        let cancel = Arc::new(AtomicBool::new(false));
        let active_pid = Arc::new(AtomicU32::new(0));
        let supervisor = Supervisor {
            jobs: self.jobs,
            settings: self.settings,
            engine: self.engine,
            subscribers: self.subscribers,
            cancel: Arc::clone(&cancel),
            active_pid: Arc::clone(&active_pid),
        };
        let thread = thread::spawn(move || supervisor.run());

        Ok(BatchHandle {
            cancel,
            active_pid,
            thread: Some(thread),
        })
    }
}

/// Caller-side handle to a running batch. Cancellation is the only control
/// it exposes; all mutable batch state lives on the supervising thread.
pub struct BatchHandle {
    cancel: Arc<AtomicBool>,
    active_pid: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl BatchHandle {
    /// Request cancellation. Idempotent; a second call has no further
    /// observable effect. The currently running engine process, if any, is
    /// signalled directly so a hung engine cannot stall the request.
    pub fn cancel(&self) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            let pid = self.active_pid.load(Ordering::SeqCst);
            if pid != 0 {
                terminate_pid(pid);
            }
        }
    }

    /// Block until the supervising thread finishes.
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct Supervisor {
    jobs: Vec<ConversionJob>,
    settings: CodecSettings,
    engine: Engine,
    subscribers: Vec<Sender<BatchEvent>>,
    cancel: Arc<AtomicBool>,
    active_pid: Arc<AtomicU32>,
}

impl Supervisor {
    fn run(self) {
        for (index, job) in self.jobs.iter().enumerate() {
            if self.cancelled() {
                self.publish(BatchEvent::JobFinished {
                    index,
                    outcome: JobOutcome::Skipped,
                });
                continue;
            }

            self.publish(BatchEvent::JobStarted {
                index,
                name: job.display_name(),
            });
            tracing::info!(job = index, input = %job.input_path.display(), "starting conversion");

            let outcome = self.run_job(index, job);
            if let JobOutcome::Failed(failure) = &outcome {
                tracing::warn!(job = index, %failure, "conversion failed");
            }
            self.publish(BatchEvent::JobFinished { index, outcome });
        }

        self.publish(BatchEvent::BatchComplete);
    }

    fn run_job(&self, index: usize, job: &ConversionJob) -> JobOutcome {
        let args = self.engine.build_args(&self.settings, job);
        let mut state = ProgressState::default();
        self.forward_line(
            index,
            format!("Command: {}", self.engine.render_command(&args)),
            &mut state,
        );

        let mut child = match Command::new(self.engine.path())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return JobOutcome::Failed(JobFailure::Spawn(err.to_string())),
        };

        self.active_pid.store(child.id(), Ordering::SeqCst);
        let lines = merge_output_lines(&mut child);
        let mut terminated = false;

        loop {
            match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => self.forward_line(index, line, &mut state),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.cancelled() {
                terminated = true;
                terminate_child(&child);
                break;
            }
        }
        drop(lines);
        self.active_pid.store(0, Ordering::SeqCst);

        let status = if terminated {
            wait_with_grace(&mut child)
        } else {
            child.wait()
        };

        match status {
            Ok(status) if status.success() && !self.cancelled() => JobOutcome::Succeeded,
            Ok(status) => match status.code() {
                Some(code) if code != 0 => JobOutcome::Failed(JobFailure::ExitCode(code)),
                _ => JobOutcome::Failed(JobFailure::Terminated),
            },
            Err(err) => JobOutcome::Failed(JobFailure::Spawn(err.to_string())),
        }
    }

    fn forward_line(&self, index: usize, line: String, state: &mut ProgressState) {
        let update = state.observe_line(&line);
        match update.category {
            LineCategory::Error | LineCategory::Warning => {
                tracing::warn!(job = index, "{line}")
            },
            _ => tracing::debug!(job = index, "{line}"),
        }
        self.publish(BatchEvent::EngineLine {
            index,
            line,
            update,
        });
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn publish(&self, event: BatchEvent) {
        for tx in &self.subscribers {
            let _ = tx.send(event.clone());
        }
    }
}

/// Merge the child's stdout and stderr into a single line channel. The
/// forwarder threads end on pipe EOF or when the receiver is dropped.
fn merge_output_lines(child: &mut Child) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_forwarder(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_forwarder(stderr, tx);
    }
    rx
}

fn spawn_line_forwarder<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                },
                Err(_) => break,
            }
        }
    });
}

fn wait_with_grace(child: &mut Child) -> std::io::Result<ExitStatus> {
    let deadline = Instant::now() + TERMINATE_GRACE_PERIOD;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }
    tracing::warn!(pid = child.id(), "engine ignored terminate signal; killing");
    let _ = child.kill();
    child.wait()
}

fn terminate_child(child: &Child) {
    terminate_pid(child.id());
}

/// SIGTERM first, so the engine can flush and clean up partial output. The
/// force kill only happens after the grace period expires.
#[cfg(unix)]
fn terminate_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    const RECV_TIMEOUT: Duration = Duration::from_secs(30);

    fn fake_engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-engine");
        fs::write(
            &path,
            format!("#!/bin/sh\ncase \"$1\" in -version) exit 0;; esac\n{body}\n"),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn jobs(names: &[&str]) -> Vec<ConversionJob> {
        names
            .iter()
            .map(|n| ConversionJob::with_derived_output(PathBuf::from(n), None))
            .collect()
    }

    fn collect_events(rx: &Receiver<BatchEvent>) -> Vec<BatchEvent> {
        let mut events = vec![];
        loop {
            let event = rx.recv_timeout(RECV_TIMEOUT).expect("batch stalled");
            let done = matches!(event, BatchEvent::BatchComplete);
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn outcomes(events: &[BatchEvent]) -> Vec<JobOutcome> {
        events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::JobFinished { outcome, .. } => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_failed_job_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(
            dir.path(),
            concat!(
                "echo 'Duration: 00:00:10.00' >&2\n",
                "echo 'frame=100 time=00:00:05.00 speed=2.0x' >&2\n",
                "case \"$2\" in *boom*) echo 'Error opening input' >&2; exit 3;; esac\n",
                "exit 0",
            ),
        );

        let mut batch = Batch::new(
            jobs(&["a.mkv", "boom.mkv", "c.mkv"]),
            CodecSettings::default(),
            Engine::new(engine),
        );
        let rx = batch.subscribe();
        let handle = batch.start().unwrap();
        let events = collect_events(&rx);
        handle.wait();

        assert_eq!(
            outcomes(&events),
            vec![
                JobOutcome::Succeeded,
                JobOutcome::Failed(JobFailure::ExitCode(3)),
                JobOutcome::Succeeded,
            ]
        );
        // One BatchComplete, strictly last.
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BatchEvent::BatchComplete))
                .count(),
            1
        );
        assert!(matches!(events.last(), Some(BatchEvent::BatchComplete)));

        // The progress line made it through the parser with percent and ETA.
        let progress_seen = events.iter().any(|e| match e {
            BatchEvent::EngineLine { update, .. } => update
                .snapshot
                .as_ref()
                .is_some_and(|s| s.percent == Some(50.0) && s.remaining_seconds == Some(2.5)),
            _ => false,
        });
        assert!(progress_seen);
    }

    #[test]
    fn test_job_events_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(dir.path(), "exit 0");

        let mut batch = Batch::new(
            jobs(&["a.mkv", "b.mkv"]),
            CodecSettings::default(),
            Engine::new(engine),
        );
        let rx = batch.subscribe();
        let handle = batch.start().unwrap();
        let events = collect_events(&rx);
        handle.wait();

        // All of job 0's events precede job 1's start event.
        let mut current = None;
        for event in &events {
            match event {
                BatchEvent::JobStarted { index, .. } => {
                    assert_eq!(*index, current.map_or(0, |c: usize| c + 1));
                    current = Some(*index);
                },
                BatchEvent::EngineLine { index, .. } | BatchEvent::JobFinished { index, .. } => {
                    assert_eq!(Some(*index), current);
                },
                BatchEvent::BatchComplete => (),
            }
        }
        assert_eq!(outcomes(&events).len(), 2);
    }

    #[test]
    fn test_cancel_mid_job_skips_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(dir.path(), "echo 'started' >&2\nexec sleep 30");

        let mut batch = Batch::new(
            jobs(&["a.mkv", "b.mkv", "c.mkv"]),
            CodecSettings::default(),
            Engine::new(engine),
        );
        let rx = batch.subscribe();
        let handle = batch.start().unwrap();

        // Wait until the first job is demonstrably running, then cancel.
        loop {
            match rx.recv_timeout(RECV_TIMEOUT).expect("batch stalled") {
                BatchEvent::EngineLine { line, .. } if line == "started" => break,
                _ => (),
            }
        }
        let cancelled_at = Instant::now();
        handle.cancel();
        handle.cancel(); // idempotent

        let events = collect_events(&rx);
        handle.wait();

        assert_eq!(
            outcomes(&events),
            vec![
                JobOutcome::Failed(JobFailure::Terminated),
                JobOutcome::Skipped,
                JobOutcome::Skipped,
            ]
        );
        assert!(matches!(events.last(), Some(BatchEvent::BatchComplete)));
        // Terminated within the grace period, not force-killed at its end.
        assert!(cancelled_at.elapsed() < TERMINATE_GRACE_PERIOD);
    }

    #[test]
    fn test_start_probes_engine_eagerly() {
        let batch = Batch::new(
            jobs(&["a.mkv"]),
            CodecSettings::default(),
            Engine::new(PathBuf::from("/nonexistent/engine")),
        );
        assert!(matches!(
            batch.start(),
            Err(ConvertError::EngineNotFound(_))
        ));
    }

    #[test]
    fn test_empty_batch_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine(dir.path(), "exit 0");

        let mut batch = Batch::new(vec![], CodecSettings::default(), Engine::new(engine));
        let rx = batch.subscribe();
        let handle = batch.start().unwrap();
        let events = collect_events(&rx);
        handle.wait();

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BatchEvent::BatchComplete));
    }

    #[test]
    fn test_spawn_error_becomes_failed_outcome() {
        // Exercise the job boundary directly; the eager probe normally
        // catches a missing engine before any job runs.
        let supervisor = Supervisor {
            jobs: jobs(&["a.mkv"]),
            settings: CodecSettings::default(),
            engine: Engine::new(PathBuf::from("/nonexistent/engine")),
            subscribers: vec![],
            cancel: Arc::new(AtomicBool::new(false)),
            active_pid: Arc::new(AtomicU32::new(0)),
        };
        let outcome = supervisor.run_job(0, &supervisor.jobs[0]);
        assert!(matches!(outcome, JobOutcome::Failed(JobFailure::Spawn(_))));
    }
}
