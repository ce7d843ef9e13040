//! WeasyPrint backend: the browser still captures printable HTML, but PDFs are
//! rendered by the external `weasyprint` executable, one child process per page size.

use super::{
    expect_ready, CaptureRequest, ChromeEngine, ChromeLauncher, Engine, EngineError,
    EngineLauncher, LaunchError, PageSize, WarmRequest,
};
use crate::interrupt::Interrupt;
use crate::poller::{poll_until_ready, PollPolicy, ProbeError, DEFAULT_POLL_INTERVAL};
use reqwest::Url;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};

/// Keep this many bytes of stderr in error messages.
const STDERR_TAIL: usize = 400;

/// Launches a browser for capture and renders with WeasyPrint.
#[derive(Debug, Clone)]
pub struct WeasyPrintLauncher {
    chrome: ChromeLauncher,
    executable: PathBuf,
    poll_interval: Duration,
    interrupt: Interrupt,
}

impl WeasyPrintLauncher {
    pub fn new(chrome: ChromeLauncher, executable: PathBuf, interrupt: Interrupt) -> Self {
        WeasyPrintLauncher {
            chrome,
            executable,
            poll_interval: DEFAULT_POLL_INTERVAL,
            interrupt,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl EngineLauncher for WeasyPrintLauncher {
    fn launch(&self) -> Result<Box<dyn Engine>, LaunchError> {
        Ok(Box::new(WeasyPrintEngine {
            browser: self.chrome.launch_chrome()?,
            executable: self.executable.clone(),
            poll_interval: self.poll_interval,
            interrupt: self.interrupt.clone(),
        }))
    }
}

pub struct WeasyPrintEngine {
    browser: ChromeEngine,
    executable: PathBuf,
    poll_interval: Duration,
    interrupt: Interrupt,
}

/// Kills and reaps the child when dropped, so a timeout or interrupt never leaves it running.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            debug!(pid = self.0.id(), "killing weasyprint");
            let _ = self.0.kill();
        }
        let _ = self.0.wait();
    }
}

impl Engine for WeasyPrintEngine {
    fn warm(&mut self, request: &WarmRequest) -> Result<(), EngineError> {
        self.browser.warm(request)
    }

    fn capture_html(&mut self, request: &CaptureRequest) -> Result<String, EngineError> {
        self.browser.capture_html(request)
    }

    fn render_pdf(
        &mut self,
        html: &Path,
        size: PageSize,
        timeout: Duration,
    ) -> Result<Vec<u8>, EngineError> {
        info!("Rendering {} PDF with WeasyPrint", size.label());
        render_with_weasyprint(
            &self.executable,
            html,
            timeout,
            self.poll_interval,
            &self.interrupt,
        )
    }
}

/// Run `executable --base-url <dir of html> <html> <output>` and return the PDF it wrote.
/// The child is killed if it outlives `timeout` or the interrupt is raised.
pub(crate) fn render_with_weasyprint(
    executable: &Path,
    html: &Path,
    timeout: Duration,
    poll_interval: Duration,
    interrupt: &Interrupt,
) -> Result<Vec<u8>, EngineError> {
    let program = executable.display().to_string();
    let html_dir = html
        .canonicalize()
        .map_err(|e| EngineError::io(html, e))?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let base_url = Url::from_directory_path(&html_dir)
        .map(|u| u.to_string())
        .map_err(|_| EngineError::Process {
            program: program.clone(),
            detail: format!("not a directory path: {}", html_dir.display()),
        })?;
    let output = tempfile::Builder::new()
        .prefix(".weasyprint-")
        .suffix(".pdf")
        .tempfile_in(&html_dir)
        .map_err(|e| EngineError::io(&html_dir, e))?;
    let mut stderr = tempfile::tempfile().map_err(|e| EngineError::io(Path::new("<stderr>"), e))?;
    let stderr_handle = stderr
        .try_clone()
        .map_err(|e| EngineError::io(Path::new("<stderr>"), e))?;

    let child = Command::new(executable)
        .arg("--base-url")
        .arg(&base_url)
        .arg(html)
        .arg(output.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_handle))
        .spawn()
        .map_err(|e| EngineError::Process {
            program: program.clone(),
            detail: format!("could not run {}: {}. Is WeasyPrint installed?", program, e),
        })?;
    let mut child = ChildGuard(child);

    let mut status = None;
    let mut probe = || -> Result<bool, ProbeError> {
        status = child
            .0
            .try_wait()
            .map_err(|e| ProbeError::new(e.to_string()))?;
        Ok(status.is_some())
    };
    let policy = PollPolicy::new(timeout, poll_interval);
    let readiness = poll_until_ready(&mut probe, policy, interrupt);
    expect_ready("weasyprint", readiness, timeout)?;

    match status {
        Some(s) if s.success() => {
            let bytes =
                std::fs::read(output.path()).map_err(|e| EngineError::io(output.path(), e))?;
            debug!(bytes = bytes.len(), "weasyprint finished");
            Ok(bytes)
        }
        other => Err(EngineError::Process {
            program,
            detail: format!(
                "exited with {}: {}",
                other.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".into()),
                read_tail(&mut stderr)
            ),
        }),
    }
}

/// Last [STDERR_TAIL] bytes of a captured stream, trimmed.
fn read_tail(file: &mut std::fs::File) -> String {
    let mut buf = Vec::new();
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let start = buf.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Scripts are written then executed; serialising the tests keeps another test's
    /// fork from holding a script open for writing (ETXTBSY).
    static SCRIPTS: Mutex<()> = Mutex::new(());

    /// A stand-in for `weasyprint` with the given shell body. `$2` is the base URL,
    /// `$3` the HTML file and `$4` the output PDF.
    #[cfg(unix)]
    fn fake_weasyprint(dir: &Path, body: &str) -> std::io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("weasyprint");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn html_in(dir: &Path) -> std::io::Result<PathBuf> {
        let html = dir.join("book.html");
        std::fs::write(&html, "<html><body>Genesis</body></html>")?;
        Ok(html)
    }

    #[cfg(unix)]
    #[test]
    fn successful_run_returns_output_and_passes_base_url() -> Result<(), Box<dyn std::error::Error>>
    {
        let _lock = SCRIPTS.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let exe = fake_weasyprint(dir.path(), r#"printf '%%PDF %s' "$2" > "$4""#)?;
        let html = html_in(dir.path())?;
        let bytes = render_with_weasyprint(
            &exe,
            &html,
            Duration::from_secs(20),
            Duration::from_millis(20),
            &Interrupt::new(),
        )?;
        let text = String::from_utf8(bytes)?;
        assert!(text.starts_with("%PDF file://"), "{text}");
        assert!(text.ends_with('/'), "{text}");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".weasyprint-"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failed_run_reports_status_and_stderr_tail() -> Result<(), Box<dyn std::error::Error>> {
        let _lock = SCRIPTS.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let exe = fake_weasyprint(dir.path(), "echo 'ERROR: bad css' >&2\nexit 3")?;
        let html = html_in(dir.path())?;
        let err = render_with_weasyprint(
            &exe,
            &html,
            Duration::from_secs(20),
            Duration::from_millis(20),
            &Interrupt::new(),
        )
        .expect_err("non-zero exit");
        match &err {
            EngineError::Process { program, detail } => {
                assert_eq!(program, &exe.display().to_string());
                assert!(detail.contains('3'), "{detail}");
                assert!(detail.ends_with("ERROR: bad css"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn slow_run_times_out_and_is_killed() -> Result<(), Box<dyn std::error::Error>> {
        let _lock = SCRIPTS.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let exe = fake_weasyprint(dir.path(), "exec sleep 30")?;
        let html = html_in(dir.path())?;
        let started = Instant::now();
        let err = render_with_weasyprint(
            &exe,
            &html,
            Duration::from_millis(300),
            Duration::from_millis(20),
            &Interrupt::new(),
        )
        .expect_err("sleeps past the timeout");
        assert!(matches!(err, EngineError::Timeout { ref stage, .. } if stage == "weasyprint"));
        // Dropping the guard waits on the child, so a quick return means it was killed.
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn raised_interrupt_stops_the_child() -> Result<(), Box<dyn std::error::Error>> {
        let _lock = SCRIPTS.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir()?;
        let exe = fake_weasyprint(dir.path(), "exec sleep 30")?;
        let html = html_in(dir.path())?;
        let interrupt = Interrupt::new();
        interrupt.raise();
        let started = Instant::now();
        let err = render_with_weasyprint(
            &exe,
            &html,
            Duration::from_secs(20),
            Duration::from_millis(20),
            &interrupt,
        )
        .expect_err("interrupted");
        assert!(matches!(err, EngineError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn missing_executable_suggests_installing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let html = html_in(dir.path())?;
        let err = render_with_weasyprint(
            &dir.path().join("no-such-weasyprint"),
            &html,
            Duration::from_secs(1),
            Duration::from_millis(20),
            &Interrupt::new(),
        )
        .expect_err("not installed");
        assert!(err.to_string().contains("Is WeasyPrint installed?"), "{err}");
        Ok(())
    }

    #[test]
    fn read_tail_keeps_end_of_stream() -> std::io::Result<()> {
        let mut f = tempfile::tempfile()?;
        let long = "x".repeat(1000) + "\nERROR: bad css\n";
        f.write_all(long.as_bytes())?;
        let tail = read_tail(&mut f);
        assert!(tail.ends_with("ERROR: bad css"));
        assert!(tail.len() <= STDERR_TAIL);
        Ok(())
    }
}
