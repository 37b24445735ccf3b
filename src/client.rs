use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn, LevelFilter};

use crate::args::{CompilerArgs, LocalReason};
use crate::compiler::{self, CompilerInfo};
use crate::config::{self, Config, Options};
use crate::fingerprint::Fingerprint;
use crate::preprocess;
use crate::scheduler::SchedulerSession;
use crate::select::Select;
use crate::slots::{self, Slot, SlotKind};
use crate::watchdog::{Stage, Watchdog};
use crate::websocket::{MessageType, State};

pub const RECURSION_GUARD: &str = "FISKC_INVOKED";

pub const EXIT_FORK_FAILURE: i32 = 101;
pub const EXIT_EXEC_FAILURE: i32 = 102;
pub const EXIT_WAIT_FAILURE: i32 = 103;
pub const EXIT_RECURSION: i32 = 104;
pub const EXIT_CONFIG_FAILURE: i32 = 105;
pub const EXIT_BAD_LOG_LEVEL: i32 = 106;
pub const EXIT_NO_COMPILER: i32 = 107;
pub const EXIT_VERSION_MISMATCH: i32 = 108;
pub const EXIT_VERIFY_CONNECT_FAILURE: i32 = 109;

/// What local execution needs: the real compiler and the argv to hand it.
/// Cloned into the watchdog thread so a stalled stage can bail out without
/// asking the driver.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub compiler: PathBuf,
    pub argv: Vec<String>,
}

extern "C" fn release_slots_at_exit() {
    slots::release_all();
}

extern "C" fn fatal_signal(signal: libc::c_int) {
    slots::release_all();
    if signal != libc::SIGINT {
        let msg = b"fiskc: caught fatal signal\n";
        unsafe {
            libc::write(2, msg.as_ptr().cast(), msg.len());
        }
    }
    unsafe { libc::_exit(-signal) }
}

fn install_signal_handlers() {
    let handler = fatal_signal as extern "C" fn(libc::c_int);
    for signal in [
        libc::SIGINT,
        libc::SIGHUP,
        libc::SIGQUIT,
        libc::SIGILL,
        libc::SIGABRT,
        libc::SIGFPE,
        libc::SIGSEGV,
        libc::SIGALRM,
        libc::SIGTERM,
    ] {
        unsafe {
            libc::signal(signal, handler as libc::sighandler_t);
        }
    }
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_logging(config: &Config, options: &Options) -> Result<(), String> {
    let level = if options.debug {
        LevelFilter::Debug
    } else if options.verbose {
        LevelFilter::Trace
    } else {
        match config.log_level.as_deref() {
            None => LevelFilter::Error,
            Some(name) => match name.to_lowercase().as_str() {
                "verbose" => LevelFilter::Trace,
                "debug" => LevelFilter::Debug,
                "warn" => LevelFilter::Warn,
                "error" | "fatal" => LevelFilter::Error,
                "silent" => LevelFilter::Off,
                other => return Err(other.to_string()),
            },
        }
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "fiskc[{}] {}: {}",
                std::process::id(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());
    if let Some(path) = &config.log_file {
        let mut open = OpenOptions::new();
        open.create(true).write(true);
        if config.log_file_append {
            open.append(true);
        } else {
            open.truncate(true);
        }
        match open.open(path) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(e) => eprintln!("fiskc: can't open log file {}: {e}", path.display()),
        }
    }
    let _ = dispatch.apply();
    Ok(())
}

fn is_atty() -> bool {
    if unsafe { libc::isatty(libc::STDOUT_FILENO) } == 0 {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) => !term.eq_ignore_ascii_case("dumb"),
        Err(_) => true,
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(path)
}

/// When invoked as plain `fiskc`, decide between the C and C++ driver from
/// what the command line looks like.
fn infer_compiler(args: &[String]) -> &'static str {
    let cxx_suffixes = [".cpp", ".cxx", ".cc", ".cpp.o", ".cxx.o", ".cc.o"];
    for arg in &args[1..] {
        let lower = arg.to_lowercase();
        if cxx_suffixes.iter().any(|s| lower.ends_with(s))
            || arg.ends_with(".C")
            || arg.ends_with(".C.o")
            || (arg.starts_with("-std=") && arg[5..].contains("++"))
        {
            return if cfg!(target_os = "macos") { "clang++" } else { "g++" };
        }
    }
    if cfg!(target_os = "macos") {
        "clang"
    } else {
        "gcc"
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One statistics line, appended under an exclusive flock.
struct Statistics {
    start_ms: u64,
    source_file: Option<String>,
    output_file: Option<String>,
    local_reason: Option<&'static str>,
    command_line: Option<String>,
    cpp_size: Option<usize>,
    cpp_time_ms: Option<u64>,
    cpp_slot_time_ms: Option<u64>,
    output_size: Option<u64>,
}

impl Statistics {
    fn new() -> Self {
        Statistics {
            start_ms: now_ms(),
            source_file: None,
            output_file: None,
            local_reason: None,
            command_line: None,
            cpp_size: None,
            cpp_time_ms: None,
            cpp_slot_time_ms: None,
            output_size: None,
        }
    }

    fn write(&self, config: &Config) {
        let Some(path) = &config.statistics_log else {
            return;
        };
        let mut stats = serde_json::Map::new();
        stats.insert("start".to_string(), (self.start_ms as f64 / 1000.0).into());
        stats.insert("end".to_string(), (now_ms() as f64 / 1000.0).into());
        if let Some(source) = &self.source_file {
            stats.insert("sourceFile".to_string(), source.clone().into());
            if let Ok(meta) = std::fs::metadata(source) {
                stats.insert("source_size".to_string(), meta.len().into());
            }
        }
        let output_size = self.output_size.or_else(|| {
            self.output_file
                .as_ref()
                .and_then(|o| std::fs::metadata(o).ok())
                .map(|m| m.len())
        });
        if let Some(size) = output_size {
            stats.insert("output_size".to_string(), size.into());
        }
        if let Some(size) = self.cpp_size {
            stats.insert("cpp_size".to_string(), size.into());
        }
        if let Some(ms) = self.cpp_time_ms {
            stats.insert("cpp_time".to_string(), ms.into());
        }
        if let Some(reason) = self.local_reason {
            stats.insert("local".to_string(), reason.into());
        }
        if let Some(command_line) = &self.command_line {
            stats.insert("command_line".to_string(), command_line.clone().into());
        }
        let line = serde_json::Value::Object(stats).to_string();

        let file = OpenOptions::new().create(true).append(true).open(path);
        let mut file = match file {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open statistics log {}: {e}", path.display());
                return;
            }
        };
        unsafe {
            if libc::flock(file.as_raw_fd(), libc::LOCK_EX) != 0 {
                error!(
                    "Failed to lock statistics log {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                );
                return;
            }
        }
        let _ = file.write_all(line.as_bytes());
        let _ = file.write_all(b"\n");
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Replaces this process with a local compile. Fork (with EAGAIN backoff),
/// exec the real compiler in the child, wait, release the slot, and exit
/// with the child's status.
pub fn run_local(config: &Config, exec: &ExecContext, slot: Option<Slot>, reason: &str) -> ! {
    warn!(
        "Running local: {} {} because {reason}",
        exec.compiler.display(),
        shlex::try_join(exec.argv.iter().skip(1).map(String::as_str)).unwrap_or_default()
    );

    let compiler = CString::new(exec.compiler.as_os_str().as_encoded_bytes().to_vec())
        .expect("compiler path contains NUL");
    let mut argv_storage: Vec<CString> = Vec::with_capacity(exec.argv.len());
    argv_storage.push(compiler.clone());
    for arg in exec.argv.iter().skip(1) {
        argv_storage.push(CString::new(arg.as_str()).expect("argument contains NUL"));
    }
    let mut argv: Vec<*const libc::c_char> =
        argv_storage.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    const BACKOFF_STEP: u64 = 75;
    const BACKOFF_MAX: u64 = 750;
    const EXEC_ATTEMPTS: usize = 10;

    let exec_child = |exit_code: i32| -> ! {
        let mut backoff = 0u64;
        for _ in 0..EXEC_ATTEMPTS {
            unsafe {
                libc::execv(compiler.as_ptr(), argv.as_ptr());
            }
            backoff = (backoff + BACKOFF_STEP).min(BACKOFF_MAX);
            error!(
                "execv({}) failed ({}), retrying in {backoff}ms",
                exec.compiler.display(),
                std::io::Error::last_os_error()
            );
            std::thread::sleep(Duration::from_millis(backoff));
        }
        std::process::exit(exit_code);
    };

    let mut backoff = 0u64;
    let pid = loop {
        let pid = unsafe { libc::fork() };
        if pid >= 0 {
            break pid;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) || backoff >= BACKOFF_MAX {
            error!("Failed to fork: {err}");
            drop(slot);
            exec_child(EXIT_FORK_FAILURE);
        }
        backoff += BACKOFF_STEP;
        error!("fork failed with EAGAIN, retrying in {backoff}ms");
        std::thread::sleep(Duration::from_millis(backoff));
    };

    if pid == 0 {
        exec_child(EXIT_EXEC_FAILURE);
    }

    let mut status: libc::c_int = 0;
    let ret = loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break ret;
        }
    };
    drop(slot);
    if ret < 0 {
        std::process::exit(EXIT_WAIT_FAILURE);
    }
    if libc::WIFEXITED(status) {
        std::process::exit(libc::WEXITSTATUS(status));
    }
    std::process::exit(EXIT_WAIT_FAILURE);
}

fn scheduler_headers(config: &Config, hash: &str, source_basename: Option<&str>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    headers.push(("x-fisk-environments".to_string(), hash.to_string()));
    if let Some(source) = source_basename {
        headers.push(("x-fisk-sourcefile".to_string(), source.to_string()));
    }
    headers.push(("x-fisk-client-name".to_string(), config.client_name()));
    if let Some(user) = std::env::var("USER")
        .ok()
        .or_else(|| std::env::var("USERNAME").ok())
    {
        headers.push(("x-fisk-user".to_string(), user));
    }
    headers.push(("x-fisk-npm-version".to_string(), crate::VERSION.to_string()));
    headers.push((
        "x-fisk-config-version".to_string(),
        crate::CONFIG_VERSION.to_string(),
    ));
    if let Some(builder) = &config.builder {
        headers.push(("x-fisk-builder".to_string(), builder.clone()));
    }
    if let Ok(host) = hostname::get() {
        headers.push((
            "x-fisk-client-hostname".to_string(),
            host.to_string_lossy().into_owned(),
        ));
    }
    headers
}

/// `--verify`: handshake with the scheduler over `/client_verify`.
fn verify(config: &Config) -> i32 {
    let headers = scheduler_headers(config, "", None);
    let url = format!("{}/client_verify", config.scheduler_url());
    let mut session = match SchedulerSession::connect(&url, &headers) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("fiskc: failed to connect to scheduler {url}: {e}");
            return EXIT_VERIFY_CONNECT_FAILURE;
        }
    };
    let select = match Select::new() {
        Ok(select) => select,
        Err(e) => {
            eprintln!("fiskc: {e}");
            return EXIT_VERIFY_CONNECT_FAILURE;
        }
    };
    let watchdog_stub = Watchdog::start(
        Arc::new(Config {
            watchdog: false,
            ..config.clone()
        }),
        ExecContext {
            compiler: PathBuf::new(),
            argv: Vec::new(),
        },
    );
    while session.running() {
        if select.exec(&mut [&mut session.ws], None).is_err() {
            break;
        }
        session.poll(&watchdog_stub);
    }
    if let Some(minimum) = session.outcome.version_mismatch {
        eprintln!(
            "fiskc: version {} is older than the scheduler's minimum {minimum}",
            crate::VERSION
        );
        return EXIT_VERSION_MISMATCH;
    }
    if session.outcome.version_verified {
        println!("fiskc: version {} verified", crate::VERSION);
        return 0;
    }
    eprintln!("fiskc: no verification from scheduler {url}");
    EXIT_VERIFY_CONNECT_FAILURE
}

/// Builds the `/etc/compiler_info` payload and hands the environment
/// packaging to the external `fisk-create-env` script; its stdout names
/// the tarball.
fn prepare_environment(info: &CompilerInfo, hash: &str) -> crate::Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::Builder::new().prefix("fisk-env-").tempdir()?;

    let system = match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        other => other,
    };
    let info_path = dir.path().join(format!("compiler-info_{hash}"));
    let output = std::process::Command::new(&info.resolved).arg("-v").output()?;
    let mut verbose = String::from_utf8_lossy(&output.stdout).into_owned();
    verbose.push_str(&String::from_utf8_lossy(&output.stderr));
    let banner = serde_json::json!({
        "hash": hash,
        "system": format!("{system} {}", std::env::consts::ARCH),
        "originalPath": info.resolved.display().to_string(),
    });
    std::fs::write(&info_path, format!("{banner}\n{verbose}"))?;

    let script = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("fisk-create-env")))
        .filter(|p| p.exists())
        .or_else(|| compiler::find_in_path("fisk-create-env"))
        .ok_or_else(|| crate::Error::from("fisk-create-env not found"))?;

    debug!(
        "Running {} {} --addfile {}:/etc/compiler_info",
        script.display(),
        info.resolved.display(),
        info_path.display()
    );
    let output = std::process::Command::new(&script)
        .current_dir(dir.path())
        .env("ARG1", &info.resolved)
        .env("ARG2", "--addfile")
        .env("ARG3", format!("{}:/etc/compiler_info", info_path.display()))
        .output()?;
    if !output.status.success() {
        return Err(crate::Error::from(format!(
            "fisk-create-env failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let tarball = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix("creating "))
        .map(|name| dir.path().join(name.trim()))
        .ok_or_else(|| crate::Error::from("fisk-create-env reported no tarball"))?;
    Ok((dir, tarball))
}

fn log_timing_report(watchdog: &Watchdog, stats: &Statistics) {
    if !log::log_enabled!(log::Level::Warn) {
        return;
    }
    let mut report = format!(
        "since epoch: {} preprocess time: {}ms (slot time: {}ms)",
        stats.start_ms,
        stats.cpp_time_ms.unwrap_or(0),
        stats.cpp_slot_time_ms.unwrap_or(0)
    );
    let mut previous = 0;
    for (stage, at_ms) in watchdog.timings() {
        report.push_str(&format!("\n {}: {} ({})", stage.name(), at_ms - previous, at_ms));
        previous = at_ms;
    }
    warn!("{report}");
}

struct Invocation {
    config: Arc<Config>,
    exec: ExecContext,
    stats: Statistics,
}

impl Invocation {
    /// Terminal local fallback for every recoverable remote failure.
    fn fallback(&mut self, watchdog: &mut Watchdog, reason: &str) -> ! {
        watchdog.stop();
        self.stats.local_reason = Some("RemoteFailure");
        let slot = slots::acquire(SlotKind::Compile, &self.config);
        self.stats.write(&self.config);
        run_local(&self.config, &self.exec, Some(slot), reason)
    }
}

pub fn run() -> i32 {
    if std::env::var_os(RECURSION_GUARD).is_some() {
        eprintln!("Recursive invocation of fiskc detected.");
        return EXIT_RECURSION;
    }
    std::env::set_var(RECURSION_GUARD, "1");

    let argv: Vec<String> = std::env::args().collect();
    let (options, args) = Options::parse(&argv);

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fiskc: {e}");
            return EXIT_CONFIG_FAILURE;
        }
    };
    options.apply(&mut config);

    if let Err(bad_level) = init_logging(&config, &options) {
        eprintln!(
            "Invalid log level: {bad_level} (\"verbose\", \"debug\", \"warn\", \"error\" or \"silent\")"
        );
        return EXIT_BAD_LOG_LEVEL;
    }

    if options.help {
        config::usage(Path::new(&argv[0]));
        return 0;
    }
    if options.version {
        println!("{}", crate::VERSION);
        return 0;
    }
    if options.dump_semaphores {
        slots::dump(&config);
        return 0;
    }
    if options.clean_semaphores {
        slots::clean(&config);
        return 0;
    }

    install_signal_handlers();
    unsafe {
        libc::atexit(release_slots_at_exit);
    }

    if config.delay > 0 {
        debug!("Sleeping for {}ms", config.delay);
        std::thread::sleep(Duration::from_millis(config.delay));
    }

    if options.verify {
        return verify(&config);
    }

    let preresolved = if basename(&args[0]) == "fiskc" {
        Some(infer_compiler(&args))
    } else {
        None
    };
    let info = match compiler::find_compiler(&args[0], preresolved) {
        Ok(info) => info,
        Err(e) => {
            error!("Can't find compiler for {}: {e}", args[0]);
            eprintln!("fiskc: can't find a compiler for {}", args[0]);
            return EXIT_NO_COMPILER;
        }
    };
    debug!(
        "Resolved {} to {} (hash source {}, builder {})",
        args[0],
        info.compiler.display(),
        info.resolved.display(),
        info.builder_compiler
    );

    let config = Arc::new(config);
    let exec = ExecContext {
        compiler: info.compiler.clone(),
        argv: args.clone(),
    };
    let mut invocation = Invocation {
        config: Arc::clone(&config),
        exec: exec.clone(),
        stats: Statistics::new(),
    };
    invocation.stats.command_line = Some(args.join(" "));
    let mut watchdog = Watchdog::start(Arc::clone(&config), exec.clone());

    if !config.no_desire && !config.no_local {
        if let Some(slot) = slots::try_acquire(SlotKind::DesiredCompile, &config) {
            watchdog.stop();
            invocation.stats.local_reason = Some("NoDesire");
            invocation.stats.write(&config);
            run_local(&config, &exec, Some(slot), "nodesire");
        }
    }
    if config.disabled {
        debug!("Remote compilation disabled");
        watchdog.stop();
        let slot = slots::acquire(SlotKind::Compile, &config);
        invocation.stats.local_reason = Some("Disabled");
        invocation.stats.write(&config);
        run_local(&config, &exec, Some(slot), "disabled");
    }

    let env_info = match compiler::environment_info(&config, &info.resolved) {
        Ok(env_info) => env_info,
        Err(e) => {
            error!("Failed to hash compiler environment: {e}");
            invocation.fallback(&mut watchdog, "environment hash failure");
        }
    };

    let mut fingerprint = config.object_cache.then(Fingerprint::new);
    let compiler_args = CompilerArgs::parse(
        &info,
        env_info.major_version,
        args.clone(),
        config.color && is_atty(),
        config.json_diagnostics,
        config.source_root.as_deref(),
        fingerprint.as_mut(),
    );
    let compiler_args = match compiler_args {
        Ok(parsed) => Arc::new(parsed),
        Err(reason) => {
            debug!("Not remotable: {}", reason.as_str());
            watchdog.stop();
            invocation.stats.local_reason = Some(reason.as_str());
            let slot = slots::acquire(SlotKind::Compile, &config);
            if reason != LocalReason::Preprocess {
                invocation.stats.write(&config);
            }
            run_local(
                &config,
                &exec,
                Some(slot),
                &format!("compiler args parse failure: {}", reason.as_str()),
            );
        }
    };
    invocation.stats.source_file = Some(compiler_args.source_file().to_string());
    invocation.stats.output_file = Some(compiler_args.output().to_string());

    let select = match Select::new() {
        Ok(select) => select,
        Err(e) => {
            error!("Failed to create reactor: {e}");
            invocation.fallback(&mut watchdog, "reactor failure");
        }
    };

    let mut preprocessed = preprocess::spawn(
        &config,
        &info,
        &compiler_args,
        fingerprint,
        select.waker(),
    );

    let mut headers = scheduler_headers(
        &config,
        &env_info.hash,
        Some(basename(compiler_args.source_file())),
    );

    // Object-cache mode needs the fingerprint before the handshake, which
    // means waiting out the preprocess up front.
    if config.object_cache {
        let output = preprocessed.wait();
        invocation.stats.cpp_size = Some(output.cpp_size);
        invocation.stats.cpp_time_ms = Some(output.duration_ms);
        invocation.stats.cpp_slot_time_ms = Some(output.slot_duration_ms);
        if output.exit_status != 0 {
            error!("Preprocessing failed with {}", output.exit_status);
            invocation.fallback(&mut watchdog, "preprocess error");
        }
        if output.cpp_size == 0 {
            error!("Empty preprocessed output");
            invocation.fallback(&mut watchdog, "empty preprocessed output");
        }
        if let Some(mut fp) = preprocessed.take_fingerprint() {
            fp.update(&env_info.hash);
            let digest = fp.finish_hex();
            debug!("Job fingerprint {digest}");
            headers.push(("x-fisk-md5".to_string(), digest));
        }
    }

    let scheduler_url = format!("{}/compile", config.scheduler_url());
    let mut sched = match SchedulerSession::connect(&scheduler_url, &headers) {
        Ok(sched) => sched,
        Err(e) => {
            debug!("No scheduler: {e}");
            invocation.fallback(&mut watchdog, "scheduler connect error");
        }
    };
    while sched.running() {
        if select.exec(&mut [&mut sched.ws], None).is_err() {
            break;
        }
        sched.poll(&watchdog);
    }
    if !sched.done {
        debug!("Scheduler conversation failed: {:?}", sched.ws.error());
        invocation.fallback(&mut watchdog, "scheduler connect error 2");
    }

    if let Some(minimum) = sched.outcome.version_mismatch {
        watchdog.stop();
        eprintln!(
            "fiskc: version {} is older than the scheduler's minimum {minimum}",
            crate::VERSION
        );
        return EXIT_VERSION_MISMATCH;
    }

    if sched.outcome.needs_environment {
        watchdog.stop();
        match prepare_environment(&info, &env_info.hash) {
            Ok((_dir, tarball)) => {
                if let Err(e) = sched.upload_environment(&select, &env_info.hash, &tarball) {
                    error!("Environment upload failed: {e}");
                }
            }
            Err(e) => error!("Failed to prepare environment: {e}"),
        }
        let slot = slots::acquire(SlotKind::Compile, &config);
        invocation.stats.local_reason = Some("NeedsEnvironment");
        invocation.stats.write(&config);
        run_local(&config, &exec, Some(slot), "needs environment");
    }

    let Some(builder) = sched.outcome.builder.clone() else {
        debug!("Scheduler gave us no builder");
        invocation.fallback(&mut watchdog, "no builder");
    };
    if builder.ip.is_empty() && builder.hostname.as_deref().unwrap_or("").is_empty()
        || builder.port == 0
    {
        invocation.fallback(&mut watchdog, "no builder");
    }

    watchdog.transition(Stage::AcquiredBuilder);
    headers.push(("x-fisk-job-id".to_string(), builder.id.to_string()));
    headers.push(("x-fisk-builder-ip".to_string(), builder.ip.clone()));
    if let Some(environment) = &builder.environment {
        debug!("Builder overrides environment {} -> {environment}", env_info.hash);
        if let Some(header) = headers.iter_mut().find(|(n, _)| n == "x-fisk-environments") {
            header.1 = environment.clone();
        }
    }

    let mut session = match crate::builder::BuilderSession::connect(
        &builder.url(),
        &headers,
        config.compress,
        compiler_args.source_file().to_string(),
    ) {
        Ok(session) => session,
        Err(e) => {
            debug!("No builder connection: {e}");
            invocation.fallback(&mut watchdog, "builder connection failure");
        }
    };
    while session.ws.state() > State::None && session.ws.state() < State::ConnectedWebSocket {
        if select.exec(&mut [&mut session.ws], None).is_err() {
            break;
        }
    }
    if session.ws.state() != State::ConnectedWebSocket {
        invocation.fallback(&mut watchdog, "builder connection failure 2");
    }
    watchdog.transition(Stage::ConnectedToBuilder);

    {
        let output = preprocessed.wait();
        invocation.stats.cpp_size = Some(output.cpp_size);
        invocation.stats.cpp_time_ms = Some(output.duration_ms);
        invocation.stats.cpp_slot_time_ms = Some(output.slot_duration_ms);
        if output.exit_status != 0 {
            error!("Preprocessing failed with {}", output.exit_status);
            invocation.fallback(&mut watchdog, "preprocess error");
        }
        if output.cpp_size == 0 {
            error!("Empty preprocessed output");
            invocation.fallback(&mut watchdog, "empty preprocessed output");
        }
    }
    watchdog.transition(Stage::PreprocessFinished);

    let wait_mode = session
        .ws
        .handshake_response_header("x-fisk-wait")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    session.wait = wait_mode;

    let (body_len, cpp_stderr) = {
        let output = preprocessed.wait();
        (output.stdout.len(), output.stderr.clone())
    };
    session.set_preprocessed_stderr(&cpp_stderr);

    let mut command_line = compiler_args.command_line.clone();
    command_line[0] = info.builder_compiler.clone();
    command_line.extend(builder.extra_args.iter().cloned());
    let job = serde_json::json!({
        "commandLine": command_line,
        "argv0": info.compiler.display().to_string(),
        "wait": wait_mode,
        "bytes": body_len,
    });
    debug!("Sending job header: {job}");
    session.ws.send(MessageType::Text, job.to_string().as_bytes());

    if wait_mode {
        while !session.done
            && (session.ws.has_pending_send() || session.wait)
            && session.ws.state() == State::ConnectedWebSocket
        {
            if select.exec(&mut [&mut session.ws], None).is_err() {
                break;
            }
            session.poll(&watchdog);
        }
        if session.done {
            // object-cache hit: the body never went up
            if let Some(reason) = session.error {
                invocation.fallback(&mut watchdog, reason);
            }
            watchdog.transition(Stage::UploadedJob);
            watchdog.transition(Stage::Finished);
            watchdog.stop();
            sched.ws.close("cachehit");
            invocation.stats.output_size = Some(session.total_written);
            invocation.stats.write(&config);
            log_timing_report(&watchdog, &invocation.stats);
            return session.exit_code;
        }
        if session.ws.state() != State::ConnectedWebSocket {
            invocation.fallback(&mut watchdog, "builder protocol error");
        }
    }

    {
        let output = preprocessed.wait();
        session.ws.send(MessageType::Binary, &output.stdout);
    }
    while session.ws.has_pending_send() && session.ws.state() == State::ConnectedWebSocket {
        if select.exec(&mut [&mut session.ws], None).is_err() {
            break;
        }
        session.poll(&watchdog);
    }
    if session.ws.state() != State::ConnectedWebSocket {
        invocation.fallback(&mut watchdog, "builder connect error 3");
    }
    watchdog.transition(Stage::UploadedJob);

    while session.running() {
        if select.exec(&mut [&mut session.ws], None).is_err() {
            break;
        }
        session.poll(&watchdog);
    }
    if let Some(reason) = session.error {
        invocation.fallback(&mut watchdog, reason);
    }
    if !session.done {
        invocation.fallback(&mut watchdog, "builder connect error 4");
    }

    if session.dump_preprocessed_error && config.store_preprocessed_on_error {
        let output = preprocessed.wait();
        let path = format!("{}.error.ii", basename(compiler_args.source_file()));
        match std::fs::write(&path, &output.stdout) {
            Ok(()) => eprintln!("Wrote preprocessed source to {path}"),
            Err(e) => error!("Failed to write {path}: {e}"),
        }
    }

    watchdog.transition(Stage::Finished);
    watchdog.stop();
    sched.ws.close("job finished");
    invocation.stats.output_size = Some(session.total_written);
    invocation.stats.write(&config);
    log_timing_report(&watchdog, &invocation.stats);
    session.exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn infer_compiler_from_sources() {
        assert_eq!(infer_compiler(&argv(&["fiskc", "-c", "foo.c"])), "gcc");
        assert_eq!(infer_compiler(&argv(&["fiskc", "-c", "foo.cpp"])), "g++");
        assert_eq!(infer_compiler(&argv(&["fiskc", "-c", "foo.CXX"])), "g++");
        assert_eq!(infer_compiler(&argv(&["fiskc", "foo.cc.o", "-r"])), "g++");
        assert_eq!(
            infer_compiler(&argv(&["fiskc", "-std=c++17", "-c", "weird.c"])),
            "g++"
        );
        assert_eq!(
            infer_compiler(&argv(&["fiskc", "-std=c11", "-c", "foo.c"])),
            "gcc"
        );
    }

    #[test]
    fn statistics_line_shape() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stats.log");
        let mut config = Config::default();
        config.statistics_log = Some(log.clone());

        let mut stats = Statistics::new();
        stats.local_reason = Some("Link");
        stats.command_line = Some("gcc foo.o -o app".to_string());
        stats.write(&config);
        stats.write(&config);

        let contents = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["local"], "Link");
            assert!(parsed["start"].as_f64().unwrap() <= parsed["end"].as_f64().unwrap());
            assert_eq!(parsed["command_line"], "gcc foo.o -o app");
        }
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_FORK_FAILURE,
            EXIT_EXEC_FAILURE,
            EXIT_WAIT_FAILURE,
            EXIT_RECURSION,
            EXIT_CONFIG_FAILURE,
            EXIT_BAD_LOG_LEVEL,
            EXIT_NO_COMPILER,
            EXIT_VERSION_MISMATCH,
            EXIT_VERIFY_CONNECT_FAILURE,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
