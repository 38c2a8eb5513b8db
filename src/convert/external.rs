//! External batch-tool adapter.
//!
//! The tool is opaque: a [`ToolLocation`] names the executable, an optional
//! environment wrapper (`xvfb-run -a`, a module loader, ...) and an argument
//! template in which `{script}` is replaced by the path of a generated
//! macro.  Nothing here consults the ambient environment to find the tool.
//!
//! # Output
//! stdout and stderr are piped and drained line by line on two reader
//! threads into one channel, so the caller sees a single merged stream.
//! That stream is informational only: batch tools buffer or stay silent, so
//! callers derive progress from the output directory instead (see the
//! `on_tick` hook of [`ToolRun::wait`]).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{CancelToken, EnvironmentalError, TargetFormat};

pub const SCRIPT_PLACEHOLDER: &str = "{script}";
/// Lines of merged tool output kept for diagnostics.
pub const TAIL_LINES: usize = 40;
/// How long to keep draining output after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

fn default_args() -> Vec<String> {
    vec!["-b".into(), "-p".into(), SCRIPT_PLACEHOLDER.into()]
}

// ── ToolLocation ─────────────────────────────────────────────────────────────

/// Where the batch tool lives and how to invoke it.  Supplied by the
/// installation layer; threaded through the job, never looked up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolLocation {
    pub executable: PathBuf,
    /// Wrapper argv placed before the executable, e.g. `["xvfb-run", "-a"]`.
    #[serde(default)]
    pub wrapper:    Vec<String>,
    #[serde(default = "default_args")]
    pub args:       Vec<String>,
}

impl ToolLocation {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self { executable: executable.into(), wrapper: Vec::new(), args: default_args() }
    }

    pub fn with_wrapper<I, S>(mut self, wrapper: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wrapper = wrapper.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_located(&self) -> bool {
        self.executable.is_file()
    }

    /// Fill the template for `script`.  A template without the placeholder
    /// gets the script appended as the last argument.
    pub fn command(&self, script: &Path) -> Command {
        let script = script.to_string_lossy();
        let mut cmd = match self.wrapper.split_first() {
            Some((wrapper, flags)) => {
                let mut c = Command::new(wrapper);
                c.args(flags).arg(&self.executable);
                c
            }
            None => Command::new(&self.executable),
        };
        let mut placed = false;
        for arg in &self.args {
            if arg.contains(SCRIPT_PLACEHOLDER) {
                placed = true;
            }
            cmd.arg(arg.replace(SCRIPT_PLACEHOLDER, &script));
        }
        if !placed {
            cmd.arg(script.as_ref());
        }
        cmd
    }
}

// ── Macros ───────────────────────────────────────────────────────────────────

fn format_token(format: TargetFormat) -> &'static str {
    match format {
        TargetFormat::Hdf5  => "HDF5",
        TargetFormat::Vtk   => "VTK",
        TargetFormat::Ascii => "TECPLOT",
    }
}

/// Macro that loads `input` and writes it to `output` in `format`.
pub fn conversion_macro(input: &Path, output: &Path, format: TargetFormat) -> String {
    format!(
        "#!MC 1410\n\
         $!READDATASET '\"{input}\"'\n\
         \x20 READDATAOPTION = NEW\n\
         \x20 RESETSTYLE = YES\n\
         $!EXPORTSETUP EXPORTFORMAT = {token}\n\
         $!WRITEDATASET \"{output}\"\n\
         \x20 INCLUDEGEOM = NO\n\
         \x20 BINARY = {binary}\n\
         $!QUIT\n",
        input  = input.display(),
        output = output.display(),
        token  = format_token(format),
        binary = if format == TargetFormat::Ascii { "NO" } else { "YES" },
    )
}

/// No-op macro used to check that the tool starts and holds a license.
pub fn probe_macro() -> String {
    "#!MC 1410\n$!QUIT\n".to_string()
}

pub fn is_license_failure(line: &str) -> bool {
    const FAILURE_WORDS: &[&str] = &[
        "unavailable", "expired", "not found", "no valid", "denied",
        "failed", "invalid", "could not", "cannot", "unable",
    ];
    let line = line.to_ascii_lowercase();
    line.contains("licens") && FAILURE_WORDS.iter().any(|w| line.contains(w))
}

// ── Running ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExit {
    Finished {
        success:         bool,
        code:            Option<i32>,
        license_failure: bool,
        tail:            Vec<String>,
    },
    /// Killed after a cancellation request.
    Cancelled { tail: Vec<String> },
}

impl ToolExit {
    pub fn tail(&self) -> &[String] {
        match self {
            ToolExit::Finished { tail, .. } | ToolExit::Cancelled { tail } => tail,
        }
    }

    pub fn diagnostic(&self) -> String {
        self.tail().join("\n")
    }
}

#[derive(Default)]
struct OutputLog {
    tail:            VecDeque<String>,
    last:            Option<String>,
    license_failure: bool,
}

impl OutputLog {
    fn push(&mut self, line: String) {
        debug!(target: "cfdsnap::tool", "{line}");
        if is_license_failure(&line) {
            self.license_failure = true;
        }
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.clone());
        self.last = Some(line);
    }

    fn into_tail(self) -> Vec<String> {
        self.tail.into_iter().collect()
    }
}

fn pump<S: Read + Send + 'static>(stream: S, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c| c == '\r' || c == '\n')
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// A launched tool process with its merged output stream.
pub struct ToolRun {
    child: Child,
    lines: Receiver<String>,
}

impl ToolRun {
    pub fn spawn(tool: &ToolLocation, script: &Path) -> io::Result<Self> {
        let mut child = tool
            .command(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, lines) = mpsc::channel();
        if let Some(out) = child.stdout.take() {
            pump(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            pump(err, tx);
        }
        Ok(Self { child, lines })
    }

    /// Block until the process exits or `cancel` fires.
    ///
    /// Every `interval` the cancellation token is checked, the child is
    /// polled, and `on_tick` receives the latest output line.  Between ticks
    /// the thread sleeps on the output channel, never spins.
    pub fn wait<F>(mut self, interval: Duration, cancel: &CancelToken, mut on_tick: F) -> io::Result<ToolExit>
    where
        F: FnMut(Option<&str>),
    {
        let mut log = OutputLog::default();
        loop {
            if cancel.is_cancelled() {
                let _ = self.child.kill();
                let _ = self.child.wait();
                self.drain(&mut log);
                return Ok(ToolExit::Cancelled { tail: log.into_tail() });
            }

            if let Some(status) = self.child.try_wait()? {
                self.drain(&mut log);
                return Ok(ToolExit::Finished {
                    success:         status.success(),
                    code:            status.code(),
                    license_failure: log.license_failure,
                    tail:            log.into_tail(),
                });
            }

            on_tick(log.last.as_deref());

            let deadline = Instant::now() + interval;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match self.lines.recv_timeout(deadline - now) {
                    Ok(line) => log.push(line),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        thread::sleep(deadline - now);
                        break;
                    }
                }
            }
        }
    }

    /// Collect output still in flight.  Bounded, since a grandchild may hold
    /// the pipes open after the tool itself has exited.
    fn drain(&mut self, log: &mut OutputLog) {
        let deadline = Instant::now() + DRAIN_GRACE;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.lines.recv_timeout(deadline - now) {
                Ok(line) => log.push(line),
                Err(_) => break,
            }
        }
    }
}

/// Run the no-op macro once.  A licensing complaint or a launch failure is
/// fatal for the job; any other non-zero exit is returned as a diagnostic
/// for the caller to record as a warning.
pub fn probe(
    tool:     &ToolLocation,
    scratch:  &Path,
    interval: Duration,
    cancel:   &CancelToken,
) -> Result<Option<String>, EnvironmentalError> {
    let script = scratch.join(format!("probe-{}.mcr", uuid::Uuid::new_v4()));
    std::fs::write(&script, probe_macro()).map_err(|source| EnvironmentalError::OutputDirUnwritable {
        path: scratch.to_path_buf(),
        source,
    })?;

    let run = ToolRun::spawn(tool, &script).map_err(|e| {
        debug!(error = %e, "tool launch failed");
        EnvironmentalError::ToolNotFound { path: Some(tool.executable.clone()) }
    })?;
    let exit = run
        .wait(interval, cancel, |_| {})
        .map_err(|_| EnvironmentalError::ToolNotFound { path: Some(tool.executable.clone()) })?;
    let _ = std::fs::remove_file(&script);

    match exit {
        ToolExit::Finished { license_failure: true, .. } => {
            Err(EnvironmentalError::LicenseUnavailable { diagnostic: exit.diagnostic() })
        }
        ToolExit::Finished { success: true, .. } => Ok(None),
        ToolExit::Finished { code, .. } => {
            Ok(Some(format!("probe exited with {:?}: {}", code, exit.diagnostic())))
        }
        ToolExit::Cancelled { .. } => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_fills_template_after_wrapper() {
        let tool = ToolLocation::new("/opt/tec/bin/tec360").with_wrapper(["xvfb-run", "-a"]);
        let cmd = tool.command(Path::new("/tmp/job.mcr"));
        assert_eq!(cmd.get_program(), "xvfb-run");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-a", "/opt/tec/bin/tec360", "-b", "-p", "/tmp/job.mcr"]);
    }

    #[test]
    fn template_without_placeholder_appends_script() {
        let tool = ToolLocation::new("/usr/bin/tool").with_args(["--batch"]);
        let cmd = tool.command(Path::new("m.mcr"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--batch", "m.mcr"]);
    }

    #[test]
    fn macro_names_both_files() {
        let m = conversion_macro(Path::new("/d/riser.50.plt"), Path::new("/o/riser.50.h5"), TargetFormat::Hdf5);
        assert!(m.starts_with("#!MC 1410\n"));
        assert!(m.contains("$!READDATASET '\"/d/riser.50.plt\"'"));
        assert!(m.contains("\n$!WRITEDATASET \"/o/riser.50.h5\"\n"));
        assert!(m.contains("EXPORTFORMAT = HDF5"));
        assert!(m.ends_with("$!QUIT\n"));
    }

    #[test]
    fn license_lines() {
        assert!(is_license_failure("Error: License unavailable for product"));
        assert!(is_license_failure("FlexLM: licensing server could not be reached"));
        assert!(!is_license_failure("Loading license file /opt/lic.dat"));
        assert!(!is_license_failure("write failed: disk full"));
    }

    #[cfg(unix)]
    #[test]
    fn merged_output_and_exit_code() {
        let tool = ToolLocation::new("/bin/sh")
            .with_args(["-c", "echo out; echo err 1>&2; exit 3", SCRIPT_PLACEHOLDER]);
        let run = ToolRun::spawn(&tool, Path::new("unused")).unwrap();
        let exit = run.wait(Duration::from_millis(20), &CancelToken::new(), |_| {}).unwrap();
        match exit {
            ToolExit::Finished { success, code, tail, license_failure } => {
                assert!(!success);
                assert_eq!(code, Some(3));
                assert!(!license_failure);
                assert!(tail.contains(&"out".to_string()));
                assert!(tail.contains(&"err".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_running_tool() {
        let tool = ToolLocation::new("/bin/sh").with_args(["-c", "sleep 30", SCRIPT_PLACEHOLDER]);
        let run = ToolRun::spawn(&tool, Path::new("unused")).unwrap();
        let cancel = CancelToken::new();
        let mut ticks = 0;
        let started = Instant::now();
        let exit = run
            .wait(Duration::from_millis(20), &cancel, |_| {
                ticks += 1;
                if ticks == 3 {
                    cancel.cancel();
                }
            })
            .unwrap();
        assert!(matches!(exit, ToolExit::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
