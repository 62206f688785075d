//! PTY supervision — owns one child process behind a real TTY.
//!
//! The child sees a genuine terminal, so colour output and readline
//! behaviour match a human session. One reader thread streams output into
//! a fixed 4096-byte rolling buffer (the only memory held for output) and
//! emits events; an idle-watchdog thread raises a signal when a non-empty
//! buffer has gone silent.
//!
//! After every successful `inject`, newly observed output is flagged
//! echo-suspect for a short window so the child's terminal echo of the
//! injected bytes can never be mistaken for a fresh prompt.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use thiserror::Error;
use tracing::{debug, info};

/// Fixed rolling buffer size; growth beyond this is a bug.
pub const ROLLING_BUFFER_BYTES: usize = 4096;

/// Default echo-suppression window after an injection.
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to allocate PTY: {0}")]
    Allocate(String),
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },
    #[error("child process is gone")]
    ChildGone,
    #[error("PTY write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Events emitted by the supervisor's threads.
#[derive(Debug, Clone, PartialEq)]
pub enum PtyEvent {
    /// New output landed in the rolling buffer.
    Output { echo_suspect: bool },
    /// No output for the silence threshold while the buffer is non-empty.
    Idle,
    /// The child exited and the PTY is drained; always the final event.
    Exited,
}

/// Head-trimmed byte window over the child's output.
#[derive(Debug)]
pub struct RollingBuffer {
    bytes: Vec<u8>,
    cap: usize,
}

impl RollingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.bytes.clear();
            self.bytes.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy text view for the detector.
    pub fn tail_string(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

pub struct PtySupervisor {
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    buffer: Arc<Mutex<RollingBuffer>>,
    echo_until: Arc<Mutex<Option<Instant>>>,
    echo_window: Duration,
    alive: Arc<AtomicBool>,
    watchdog_stop: Arc<AtomicBool>,
}

impl PtySupervisor {
    /// Spawn `config` inside a fresh PTY and start the reader + watchdog
    /// threads. Events arrive on the returned receiver; the final event is
    /// always `Exited`.
    pub fn spawn(
        config: &SpawnConfig,
        silence_threshold: Duration,
        echo_window: Duration,
    ) -> Result<(Self, Receiver<PtyEvent>), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Allocate(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.program);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(program = %config.program, "spawning supervised child in PTY");
        let child = pair.slave.spawn_command(cmd).map_err(|e| PtyError::Spawn {
            program: config.program.clone(),
            message: e.to_string(),
        })?;
        // Only the master side is ours to keep.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Allocate(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Allocate(e.to_string()))?;

        let buffer = Arc::new(Mutex::new(RollingBuffer::new(ROLLING_BUFFER_BYTES)));
        let echo_until: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));
        let watchdog_stop = Arc::new(AtomicBool::new(false));
        let last_output = Arc::new(Mutex::new(Instant::now()));

        let (tx, rx) = mpsc::channel();
        spawn_reader(
            reader,
            Arc::clone(&buffer),
            Arc::clone(&echo_until),
            Arc::clone(&alive),
            Arc::clone(&last_output),
            tx.clone(),
        );
        spawn_watchdog(
            silence_threshold,
            Arc::clone(&buffer),
            Arc::clone(&last_output),
            Arc::clone(&watchdog_stop),
            Arc::clone(&alive),
            tx,
        );

        Ok((
            Self {
                writer: Mutex::new(writer),
                child: Mutex::new(child),
                master: Mutex::new(pair.master),
                buffer,
                echo_until,
                echo_window,
                alive,
                watchdog_stop,
            },
            rx,
        ))
    }

    /// Write bytes to the child's stdin and open the echo window.
    ///
    /// Bytes are written exactly as given; no newline is appended here.
    pub fn inject(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(PtyError::ChildGone);
        }
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes).map_err(|e| {
            if self.alive.load(Ordering::Relaxed) {
                PtyError::Write(e)
            } else {
                PtyError::ChildGone
            }
        })?;
        writer.flush()?;
        *self.echo_until.lock().unwrap() = Some(Instant::now() + self.echo_window);
        debug!(len = bytes.len(), "injected bytes into child");
        Ok(())
    }

    /// Current rolling-buffer contents as lossy text.
    pub fn buffer_tail(&self) -> String {
        self.buffer.lock().unwrap().tail_string()
    }

    /// Current rolling-buffer size (bounded by [`ROLLING_BUFFER_BYTES`]).
    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Best-effort probe: the child is runnable but its PTY has nothing
    /// further to read right now, suggesting a blocking read on stdin.
    pub fn blocked_on_read(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.master_has_no_pending_output()
    }

    #[cfg(unix)]
    fn master_has_no_pending_output(&self) -> bool {
        let master = self.master.lock().unwrap();
        let Some(fd) = master.as_raw_fd() else {
            return false;
        };
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // Zero timeout: readiness check only.
        let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
        rc == 0
    }

    #[cfg(not(unix))]
    fn master_has_no_pending_output(&self) -> bool {
        false
    }

    /// Ask the child to exit: SIGTERM, a grace period, then a hard kill.
    pub fn terminate(&self, grace: Duration) {
        let pid = self.child.lock().unwrap().process_id();
        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if self.child.lock().unwrap().try_wait().ok().flatten().is_some() {
                    self.alive.store(false, Ordering::Relaxed);
                    return;
                }
                std::thread::sleep(Duration::from_millis(25));
            }
        }
        #[cfg(not(unix))]
        let _ = (pid, grace);
        let _ = self.child.lock().unwrap().kill();
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Block until the child exits; returns success.
    pub fn wait(&self) -> bool {
        let status = self.child.lock().unwrap().wait();
        self.alive.store(false, Ordering::Relaxed);
        status.map(|s| s.success()).unwrap_or(false)
    }

    /// Release the PTY and stop the watchdog.
    pub fn close(&self) {
        self.watchdog_stop.store(true, Ordering::Relaxed);
        if self.alive.load(Ordering::Relaxed) {
            self.terminate(Duration::from_secs(3));
        }
    }
}

impl Drop for PtySupervisor {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    buffer: Arc<Mutex<RollingBuffer>>,
    echo_until: Arc<Mutex<Option<Instant>>>,
    alive: Arc<AtomicBool>,
    last_output: Arc<Mutex<Instant>>,
    tx: Sender<PtyEvent>,
) {
    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut chunk = [0u8; 4096];
            let mut transient_errors = 0u32;
            loop {
                let n = match reader.read(&mut chunk) {
                    Ok(0) => break, // EOF — child exited
                    Ok(n) => {
                        transient_errors = 0;
                        n
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        transient_errors += 1;
                        if transient_errors > 3 {
                            debug!("PTY read error (child likely exited): {e}");
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                };
                buffer.lock().unwrap().push(&chunk[..n]);
                *last_output.lock().unwrap() = Instant::now();
                let echo_suspect = echo_until
                    .lock()
                    .unwrap()
                    .map(|until| Instant::now() < until)
                    .unwrap_or(false);
                if tx.send(PtyEvent::Output { echo_suspect }).is_err() {
                    break;
                }
            }
            alive.store(false, Ordering::Relaxed);
            let _ = tx.send(PtyEvent::Exited);
        })
        .expect("failed to spawn pty reader thread");
}

fn spawn_watchdog(
    silence_threshold: Duration,
    buffer: Arc<Mutex<RollingBuffer>>,
    last_output: Arc<Mutex<Instant>>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    tx: Sender<PtyEvent>,
) {
    let tick = silence_threshold.div_f64(4.0).max(Duration::from_millis(25));
    std::thread::Builder::new()
        .name("pty-watchdog".to_string())
        .spawn(move || {
            let mut signaled_for: Option<Instant> = None;
            while !stop.load(Ordering::Relaxed) && alive.load(Ordering::Relaxed) {
                std::thread::sleep(tick);
                let last = *last_output.lock().unwrap();
                if last.elapsed() < silence_threshold {
                    continue;
                }
                if buffer.lock().unwrap().is_empty() {
                    continue;
                }
                // One idle signal per silent stretch.
                if signaled_for == Some(last) {
                    continue;
                }
                signaled_for = Some(last);
                if tx.send(PtyEvent::Idle).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn pty watchdog thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_shell(script: &str, silence: Duration) -> (PtySupervisor, Receiver<PtyEvent>) {
        let config = SpawnConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: Some("/tmp".to_string()),
            env: vec![],
        };
        PtySupervisor::spawn(&config, silence, DEFAULT_ECHO_WINDOW).unwrap()
    }

    fn drain_until_exit(rx: &Receiver<PtyEvent>) -> Vec<PtyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            let exited = matches!(event, PtyEvent::Exited);
            events.push(event);
            if exited {
                break;
            }
        }
        events
    }

    // ── RollingBuffer ──

    #[test]
    fn rolling_buffer_trims_head() {
        let mut buf = RollingBuffer::new(8);
        buf.push(b"abcdef");
        buf.push(b"ghij");
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.tail_string(), "cdefghij");
    }

    #[test]
    fn rolling_buffer_handles_oversized_chunk() {
        let mut buf = RollingBuffer::new(4);
        buf.push(b"0123456789");
        assert_eq!(buf.tail_string(), "6789");
    }

    #[test]
    fn rolling_buffer_never_exceeds_cap_under_flood() {
        // 100 MB through a 4096-byte window.
        let mut buf = RollingBuffer::new(ROLLING_BUFFER_BYTES);
        let chunk = [b'x'; 8192];
        for _ in 0..(100 * 1024 * 1024 / chunk.len()) {
            buf.push(&chunk);
            assert!(buf.len() <= ROLLING_BUFFER_BYTES);
        }
        assert_eq!(buf.len(), ROLLING_BUFFER_BYTES);
    }

    // ── Supervision ──

    #[test]
    fn captures_output_and_exit() {
        let (sup, rx) = spawn_shell("printf 'hello from the child'", Duration::from_secs(5));
        let events = drain_until_exit(&rx);
        assert!(events.iter().any(|e| matches!(e, PtyEvent::Output { .. })));
        assert!(matches!(events.last(), Some(PtyEvent::Exited)));
        assert!(sup.buffer_tail().contains("hello from the child"));
    }

    #[test]
    fn buffer_stays_bounded_for_real_child() {
        let (sup, rx) = spawn_shell(
            "i=0; while [ $i -lt 2000 ]; do echo 'line of output padding padding'; i=$((i+1)); done",
            Duration::from_secs(5),
        );
        let _ = drain_until_exit(&rx);
        assert!(sup.buffer_len() <= ROLLING_BUFFER_BYTES);
    }

    #[test]
    fn idle_watchdog_fires_on_silent_nonempty_buffer() {
        let (_sup, rx) = spawn_shell("printf 'waiting: '; sleep 2", Duration::from_millis(100));
        let mut saw_idle = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            match event {
                PtyEvent::Idle => {
                    saw_idle = true;
                    break;
                }
                PtyEvent::Exited => break,
                PtyEvent::Output { .. } => {}
            }
        }
        assert!(saw_idle, "watchdog never fired");
    }

    #[test]
    fn injected_reply_reaches_child() {
        let (sup, rx) = spawn_shell("read answer; printf \"got:%s\" \"$answer\"", Duration::from_secs(5));
        // Give the shell a moment to reach the read.
        std::thread::sleep(Duration::from_millis(300));
        sup.inject(b"yes\n").unwrap();
        let _ = drain_until_exit(&rx);
        assert!(
            sup.buffer_tail().contains("got:yes"),
            "child never saw the injection: {:?}",
            sup.buffer_tail()
        );
    }

    #[test]
    fn output_after_injection_is_echo_suspect() {
        let (sup, rx) = spawn_shell("read answer; echo ok", Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(300));
        // Drain startup output events first.
        while rx.try_recv().is_ok() {}
        sup.inject(b"y\n").unwrap();
        // The PTY echoes the injected bytes back; the first output event
        // after injection must be flagged.
        let mut saw_suspect = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            match event {
                PtyEvent::Output { echo_suspect: true } => {
                    saw_suspect = true;
                    break;
                }
                PtyEvent::Exited => break,
                _ => {}
            }
        }
        assert!(saw_suspect, "echo window never flagged output");
    }

    #[test]
    fn inject_after_exit_is_child_gone() {
        let (sup, rx) = spawn_shell("true", Duration::from_secs(5));
        let _ = drain_until_exit(&rx);
        // Reader observed EOF; the supervisor knows the child is gone.
        let err = sup.inject(b"y\n").unwrap_err();
        assert!(matches!(err, PtyError::ChildGone));
    }

    #[test]
    fn terminate_stops_long_running_child() {
        let (sup, rx) = spawn_shell("sleep 30", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(200));
        sup.terminate(Duration::from_millis(500));
        let events = drain_until_exit(&rx);
        assert!(matches!(events.last(), Some(PtyEvent::Exited)));
        assert!(!sup.is_alive());
    }
}
