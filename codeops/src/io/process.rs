//! Child process execution with a wall-clock timeout and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes of stdout discarded past the output limit.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout followed by stderr, decoded lossily.
    pub fn combined_lossy(&self) -> String {
        let mut out = self.stdout_lossy();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        out
    }
}

type StreamSink = Arc<Mutex<BufWriter<File>>>;

/// Run `cmd` to completion or until `timeout` elapses, killing it on timeout.
///
/// stdout/stderr are drained on reader threads so a chatty child never blocks
/// on a full pipe. At most `output_limit_bytes` of each stream are kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_inner(cmd, stdin, timeout, output_limit_bytes, None)
}

/// Like [`run_command_with_timeout`], but also writes each stdout line to
/// `stream_path` as it arrives (flushed per line) when a path is given.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), streaming = stream_path.is_some()))]
pub fn run_command_with_stream(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: Option<&Path>,
) -> Result<CommandOutput> {
    let sink = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        }
        None => None,
    };
    run_inner(cmd, stdin, timeout, output_limit_bytes, sink)
}

fn run_inner(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    sink: Option<StreamSink>,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(program = %program, err = %err, "failed to spawn command");
        anyhow!(err).context(format!("spawn {program}"))
    })?;

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        pipe.write_all(input).context("write stdin")?;
        // Dropping the pipe closes stdin so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || match sink {
        Some(sink) => read_lines_tee(stdout, output_limit_bytes, &sink),
        None => read_limited(stdout, output_limit_bytes),
    });
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(program = %program, exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn keep_within(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let keep = chunk.len().min(limit.saturating_sub(buf.len()));
    buf.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        truncated += keep_within(&mut buf, &chunk[..n], limit);
    }
    Ok((buf, truncated))
}

fn read_lines_tee<R: Read>(reader: R, limit: usize, sink: &StreamSink) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Ok(mut writer) = sink.lock()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to write stream file");
        }
        truncated += keep_within(&mut buf, &line, limit);
    }
    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = run_command_with_timeout(
            sh("printf out; printf err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_lossy(), "out");
        assert_eq!(out.stderr_lossy(), "err");
        assert_eq!(out.combined_lossy(), "out\nerr");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn stdin_is_forwarded() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.stdout, b"hello");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let out = run_command_with_timeout(
            sh("printf 0123456789"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn timeout_kills_child() {
        let out = run_command_with_timeout(
            sh("exec sleep 30"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn stream_file_receives_stdout_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("nested/stream.jsonl");
        let out = run_command_with_stream(
            sh("echo one; echo two"),
            None,
            Duration::from_secs(10),
            1024,
            Some(&stream),
        )
        .expect("run");
        assert_eq!(out.stdout_lossy(), "one\ntwo\n");
        let streamed = std::fs::read_to_string(&stream).expect("read stream");
        assert_eq!(streamed, "one\ntwo\n");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_command_with_timeout(
            Command::new("/definitely/not/a/binary"),
            None,
            Duration::from_secs(1),
            16,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }
}
