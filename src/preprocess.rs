use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, error, trace};

use crate::args::CompilerArgs;
use crate::compiler::{CompilerInfo, CompilerKind};
use crate::config::Config;
use crate::fingerprint::Fingerprint;
use crate::select::Waker;
use crate::slots::{self, SlotKind};

/// Everything the worker produced, immutable once received.
pub struct PreprocessOutput {
    /// Preprocessed source, deflated when compression is configured.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
    /// Uncompressed size of the preprocessed source.
    pub cpp_size: usize,
    pub duration_ms: u64,
    pub slot_duration_ms: u64,
    pub fingerprint: Option<Fingerprint>,
}

/// Handle to the background preprocess. `wait()` blocks until the worker
/// finishes and hands the output back; the result is cached so later reads
/// are free. Dropping the handle joins the thread.
pub struct Preprocessed {
    receiver: Receiver<PreprocessOutput>,
    thread: Option<thread::JoinHandle<()>>,
    result: Option<PreprocessOutput>,
}

impl Preprocessed {
    pub fn wait(&mut self) -> &PreprocessOutput {
        if self.result.is_none() {
            let output = self.receiver.recv().unwrap_or_else(|_| PreprocessOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_status: -1,
                cpp_size: 0,
                duration_ms: 0,
                slot_duration_ms: 0,
                fingerprint: None,
            });
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
            self.result = Some(output);
        }
        self.result.as_ref().unwrap()
    }

    pub fn take_fingerprint(&mut self) -> Option<Fingerprint> {
        self.wait();
        self.result.as_mut().and_then(|r| r.fingerprint.take())
    }
}

impl Drop for Preprocessed {
    fn drop(&mut self) {
        self.wait();
    }
}

/// Collects the preprocessed stream, optionally deflating it and feeding
/// the marker-stripped bytes to the fingerprint.
struct OutputSink {
    raw: Vec<u8>,
    encoder: Option<ZlibEncoder<Vec<u8>>>,
}

impl OutputSink {
    fn new(compress: bool) -> Self {
        OutputSink {
            raw: Vec::with_capacity(1024 * 1024),
            encoder: compress.then(|| ZlibEncoder::new(Vec::new(), Compression::default())),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.raw.extend_from_slice(chunk);
        if let Some(encoder) = self.encoder.as_mut() {
            use std::io::Write;
            if let Err(e) = encoder.write_all(chunk) {
                error!("deflate failed: {e}");
                self.encoder = None;
            }
        }
    }

    /// (possibly compressed bytes, uncompressed size)
    fn finish(mut self, fingerprint: &mut Option<Fingerprint>) -> (Vec<u8>, usize) {
        if let Some(fp) = fingerprint.as_mut() {
            fp.update_preprocessed(&self.raw);
        }
        let size = self.raw.len();
        match self.encoder.take() {
            Some(encoder) => match encoder.finish() {
                Ok(compressed) => (compressed, size),
                Err(e) => {
                    error!("deflate finish failed: {e}");
                    (self.raw, size)
                }
            },
            None => (self.raw, size),
        }
    }
}

/// Builds the preprocess-only command: the original arguments minus the
/// `-o` pair, plus `-E`, the include-rewrite flag for the compiler family,
/// and `-C` unless comments are discarded.
fn preprocess_command(info: &CompilerInfo, args: &CompilerArgs, config: &Config) -> Command {
    let mut command = Command::new(&info.compiler);
    let line = &args.command_line;
    let mut i = 1;
    while i < line.len() {
        if line[i] == "-o" && i + 1 < line.len() {
            i += 2;
            continue;
        }
        command.arg(&line[i]);
        i += 1;
    }
    command.arg("-E");
    if info.kind == CompilerKind::Clang || info.builder_compiler.contains("clang") {
        command.arg("-frewrite-includes");
    } else {
        command.arg("-fdirectives-only");
    }
    if !config.discard_comments {
        command.arg("-C");
    }
    command.env_remove(crate::client::RECURSION_GUARD);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command
}

/// Kicks off preprocessing on a worker thread. The worker owns the
/// fingerprint until the driver takes it back after `wait()`.
pub fn spawn(
    config: &Arc<Config>,
    info: &CompilerInfo,
    args: &Arc<CompilerArgs>,
    fingerprint: Option<Fingerprint>,
    waker: Waker,
) -> Preprocessed {
    let config = Arc::clone(config);
    let info = info.clone();
    let args = Arc::clone(args);
    let (sender, receiver) = bounded(1);
    let started = Instant::now();

    let thread = thread::Builder::new()
        .name("preprocess".to_string())
        .spawn(move || {
            let mut fingerprint = fingerprint;
            let slot = slots::acquire(SlotKind::Cpp, &config);
            let slot_duration_ms = started.elapsed().as_millis() as u64;

            let mut sink = OutputSink::new(config.compress);
            let mut stderr_bytes = Vec::new();
            let exit_status;

            if args.language.is_preprocessed() {
                debug!("{} is already preprocessed", args.source_file());
                match std::fs::read(args.source_file()) {
                    Ok(contents) => {
                        sink.push(&contents);
                        exit_status = 0;
                    }
                    Err(e) => {
                        error!("Failed to read {}: {e}", args.source_file());
                        exit_status = 1;
                    }
                }
            } else {
                let mut command = preprocess_command(&info, &args, &config);
                if log::log_enabled!(log::Level::Debug) {
                    let display: Vec<String> = std::iter::once(info.compiler.display().to_string())
                        .chain(args.command_line[1..].iter().cloned())
                        .collect();
                    debug!(
                        "Preprocessing: {}",
                        shlex::try_join(display.iter().map(String::as_str))
                            .unwrap_or_default()
                    );
                }
                match command.spawn() {
                    Ok(mut child) => {
                        let stderr = child.stderr.take();
                        let stderr_thread = thread::spawn(move || {
                            let mut buf = Vec::new();
                            if let Some(mut stderr) = stderr {
                                let _ = stderr.read_to_end(&mut buf);
                            }
                            buf
                        });
                        if let Some(mut stdout) = child.stdout.take() {
                            let mut chunk = [0u8; 65536];
                            loop {
                                match stdout.read(&mut chunk) {
                                    Ok(0) => break,
                                    Ok(n) => {
                                        trace!("preprocess chunk of {n} bytes");
                                        sink.push(&chunk[..n]);
                                    }
                                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                                    Err(e) => {
                                        error!("Failed to read preprocessed output: {e}");
                                        break;
                                    }
                                }
                            }
                        }
                        stderr_bytes = stderr_thread.join().unwrap_or_default();
                        exit_status = match child.wait() {
                            Ok(status) => status.code().unwrap_or(-1),
                            Err(e) => {
                                error!("Failed to wait for preprocessor: {e}");
                                -1
                            }
                        };
                    }
                    Err(e) => {
                        error!("Failed to spawn preprocessor: {e}");
                        exit_status = -1;
                    }
                }
            }

            drop(slot);
            let (stdout, cpp_size) = sink.finish(&mut fingerprint);
            debug!(
                "Preprocessed {} to {} bytes, status {exit_status}",
                args.source_file(),
                cpp_size
            );
            let _ = sender.send(PreprocessOutput {
                stdout,
                stderr: stderr_bytes,
                exit_status,
                cpp_size,
                duration_ms: started.elapsed().as_millis() as u64,
                slot_duration_ms,
                fingerprint,
            });
            waker.wake();
        })
        .expect("failed to spawn preprocess thread");

    Preprocessed {
        receiver,
        thread: Some(thread),
        result: None,
    }
}
