#![forbid(unsafe_code)]

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK_SIZE: usize = 4096;
const CANCELED_MESSAGE: &str = "command canceled";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommandOptions<'a> {
    pub cancel_flag: Option<&'a AtomicBool>,
    pub timeout: Option<Duration>,
    /// Written to the child's stdin, which is closed afterwards. Without it
    /// stdin is `/dev/null`.
    pub stdin: Option<&'a [u8]>,
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout.trim_end(), self.stderr)
    }
}

/// Splits a configured command line into argv using POSIX shell quoting rules.
pub fn split_command_line(line: &str) -> io::Result<Vec<String>> {
    let parts = shlex::split(line).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unbalanced quoting in command: {line}"),
        )
    })?;
    if parts.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "command line is empty",
        ));
    }
    Ok(parts)
}

/// Runs `program args...` in `cwd`, streaming output chunks to `on_output`
/// as they arrive. Cancellation and timeout kill the whole process group,
/// including background children that outlive `program`.
pub fn run_command(
    cwd: &Path,
    program: &str,
    args: &[String],
    options: CommandOptions<'_>,
    on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
) -> io::Result<CommandOutput> {
    let mut command = Command::new(program);
    command.args(args);
    let mut child = spawn_in_group(command, cwd, options.stdin.is_some())?;
    if let Some(input) = options.stdin {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("failed to open command stdin"))?;
        spawn_writer(stdin, input.to_vec(), program);
    }
    supervise(child, program, options, on_output)
}

fn supervise(
    mut child: Child,
    label: &str,
    options: CommandOptions<'_>,
    mut on_output: Option<&mut dyn FnMut(OutputStream, &str)>,
) -> io::Result<CommandOutput> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("failed to capture command stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("failed to capture command stderr"))?;

    let (chunk_tx, chunk_rx) = mpsc::channel();
    let stdout_handle = spawn_reader(stdout, OutputStream::Stdout, chunk_tx.clone());
    let stderr_handle = spawn_reader(stderr, OutputStream::Stderr, chunk_tx);

    let started = Instant::now();
    let mut stdout_buffer = Vec::new();
    let mut stderr_buffer = Vec::new();
    let mut stdout_text = ChunkDecoder::default();
    let mut stderr_text = ChunkDecoder::default();
    let mut exit_status = None;

    loop {
        match chunk_rx.recv_timeout(POLL_INTERVAL) {
            Ok((stream, bytes)) => {
                let (buffer, decoder) = match stream {
                    OutputStream::Stdout => (&mut stdout_buffer, &mut stdout_text),
                    OutputStream::Stderr => (&mut stderr_buffer, &mut stderr_text),
                };
                buffer.extend_from_slice(&bytes);
                if let Some(callback) = on_output.as_deref_mut() {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() {
                        callback(stream, &text);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if exit_status.is_some() {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }

        // Checked even after the child exited: a background grandchild can
        // keep the pipes open long after that.
        if options
            .cancel_flag
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            tracing::debug!(command = label, "canceling child process");
            abort(&mut child);
            return Err(io::Error::new(io::ErrorKind::Interrupted, CANCELED_MESSAGE));
        }

        if options
            .timeout
            .is_some_and(|timeout| started.elapsed() >= timeout)
        {
            tracing::warn!(
                command = label,
                elapsed_ms = started.elapsed().as_millis(),
                exited = exit_status.is_some(),
                "child process timed out"
            );
            abort(&mut child);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("command timed out: {label}"),
            ));
        }

        if exit_status.is_none() {
            exit_status = child.try_wait()?;
        }
    }

    join_output_reader(stdout_handle, "stdout")?;
    join_output_reader(stderr_handle, "stderr")?;
    if let Some(callback) = on_output.as_deref_mut() {
        for (stream, decoder) in [
            (OutputStream::Stdout, &mut stdout_text),
            (OutputStream::Stderr, &mut stderr_text),
        ] {
            let tail = decoder.finish();
            if !tail.is_empty() {
                callback(stream, &tail);
            }
        }
    }
    let status = match exit_status {
        Some(status) => status,
        None => child.wait()?,
    };
    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout_buffer).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buffer).into_owned(),
    })
}

/// Kills the process group and reaps the child. Reader threads are left to
/// exit on their own once the pipes close.
fn abort(child: &mut Child) {
    terminate_process_group(child);
    let _ = child.wait();
}

fn spawn_reader<R>(
    mut reader: R,
    stream: OutputStream,
    chunk_tx: Sender<(OutputStream, Vec<u8>)>,
) -> thread::JoinHandle<io::Result<()>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        loop {
            let read = match reader.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            };
            if chunk_tx.send((stream, buffer[..read].to_vec())).is_err() {
                return Ok(());
            }
        }
    })
}

fn spawn_writer(mut stdin: ChildStdin, input: Vec<u8>, label: &str) {
    let label = label.to_string();
    thread::spawn(move || {
        if let Err(error) = stdin.write_all(&input)
            && error.kind() != io::ErrorKind::BrokenPipe
        {
            tracing::warn!(command = %label, "failed to write command stdin: {error}");
        }
    });
}

/// Decodes one output stream chunk by chunk, holding back a multibyte
/// character split across a chunk boundary until the rest arrives.
#[derive(Debug, Default)]
struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - incomplete_tail_len(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, or 0.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[cfg(unix)]
fn spawn_in_group(mut command: Command, cwd: &Path, piped_stdin: bool) -> io::Result<Child> {
    use std::os::unix::process::CommandExt;

    command
        .current_dir(cwd)
        .stdin(stdin_mode(piped_stdin))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
}

#[cfg(windows)]
fn spawn_in_group(mut command: Command, cwd: &Path, piped_stdin: bool) -> io::Result<Child> {
    command
        .current_dir(cwd)
        .stdin(stdin_mode(piped_stdin))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn stdin_mode(piped: bool) -> Stdio {
    if piped { Stdio::piped() } else { Stdio::null() }
}

#[cfg(unix)]
fn terminate_process_group(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };

    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
}

#[cfg(windows)]
fn terminate_process_group(child: &mut Child) {
    let pid = child.id().to_string();
    let status = Command::new("taskkill")
        .arg("/PID")
        .arg(&pid)
        .arg("/T")
        .arg("/F")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    if !matches!(status, Ok(exit_status) if exit_status.success()) {
        let _ = child.kill();
    }
}

fn join_output_reader(handle: thread::JoinHandle<io::Result<()>>, stream: &str) -> io::Result<()> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("command {stream} reader thread panicked")))?
}

#[cfg(test)]
mod decoder_tests {
    use super::*;

    #[test]
    fn split_multibyte_characters_are_held_back() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert_eq!(decoder.decode(b"\xA9 ok"), "\u{e9} ok");

        let crab = "\u{1F980}".as_bytes();
        assert_eq!(decoder.decode(&crab[..1]), "");
        assert_eq!(decoder.decode(&crab[1..3]), "");
        assert_eq!(decoder.decode(&crab[3..]), "\u{1F980}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn a_dangling_lead_byte_is_flushed_lossily() {
        let mut decoder = ChunkDecoder::default();
        assert_eq!(decoder.decode(b"end\xE2\x82"), "end");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.decode(b"\xFFnext"), "\u{FFFD}next");
    }
}
