use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::Deserialize;

const SYSTEM_CONFIG_PATH: &str = "/etc/fisk.json";
const USER_CONFIG_FILE: &str = "fisk.json";

/// Layered client configuration: `/etc/fisk.json`, then
/// `$HOME/.config/fisk.json`, then `FISK_`-prefixed environment variables,
/// later layers winning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: String,
    pub client_name: Option<String>,
    pub builder: Option<String>,

    pub scheduler_connect_timeout: u64,
    pub acquired_builder_timeout: u64,
    pub builder_connect_timeout: u64,
    pub preprocess_timeout: u64,
    pub upload_job_timeout: u64,
    pub response_timeout: u64,

    pub compile_slots: usize,
    pub cpp_slots: usize,
    pub desired_compile_slots: usize,
    pub semaphore_prefix: String,

    pub env_cache: Option<PathBuf>,
    pub statistics_log: Option<PathBuf>,

    pub object_cache: bool,
    pub source_root: Option<String>,
    pub compress: bool,
    pub discard_comments: bool,
    pub json_diagnostics: bool,
    pub color: bool,
    pub store_preprocessed_on_error: bool,
    pub watchdog: bool,

    pub no_desire: bool,
    pub no_local: bool,
    pub disabled: bool,

    pub delay: u64,

    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_file_append: bool,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Config {
            scheduler: "ws://localhost:8097".to_string(),
            client_name: None,
            builder: None,
            scheduler_connect_timeout: 1000,
            acquired_builder_timeout: 1000,
            builder_connect_timeout: 1000,
            preprocess_timeout: 60000,
            upload_job_timeout: 60000,
            response_timeout: 20000,
            compile_slots: cpus,
            cpp_slots: cpus * 2,
            desired_compile_slots: std::cmp::max(cpus / 2, 1),
            semaphore_prefix: "/fisk".to_string(),
            env_cache: default_cache_file("env-cache.json"),
            statistics_log: None,
            object_cache: false,
            source_root: None,
            compress: false,
            discard_comments: false,
            json_diagnostics: false,
            color: true,
            store_preprocessed_on_error: false,
            watchdog: true,
            no_desire: false,
            no_local: false,
            disabled: false,
            delay: 0,
            log_level: None,
            log_file: None,
            log_file_append: false,
        }
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        let mut figment = Figment::new().merge(Json::file(SYSTEM_CONFIG_PATH));
        if let Some(path) = user_config_path() {
            figment = figment.merge(Json::file(path));
        }
        figment
            .merge(Env::prefixed("FISK_"))
            .extract()
            .map_err(|e| crate::Error::from(format!("can't load configuration: {e}")))
    }

    pub fn client_name(&self) -> String {
        match &self.client_name {
            Some(name) => name.clone(),
            None => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Scheduler base URL with the `ws://` scheme and default port filled in.
    pub fn scheduler_url(&self) -> String {
        let mut url = self.scheduler.clone();
        if !url.contains("://") {
            url.insert_str(0, "ws://");
        }
        let authority = &url[url.find("://").unwrap() + 3..];
        let has_port = match authority.rfind(':') {
            Some(colon) => authority[colon + 1..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .count()
                > 0,
            None => false,
        };
        if !has_port {
            let end = url.find("://").unwrap() + 3
                + authority
                    .find('/')
                    .unwrap_or(authority.len());
            url.insert_str(end, ":8097");
        }
        url
    }

    pub fn stage_timeout(&self, stage: crate::watchdog::Stage) -> Duration {
        use crate::watchdog::Stage;
        let ms = match stage {
            Stage::Initial => self.scheduler_connect_timeout,
            Stage::ConnectedToScheduler => self.acquired_builder_timeout,
            Stage::AcquiredBuilder => self.builder_connect_timeout,
            Stage::ConnectedToBuilder => self.preprocess_timeout,
            Stage::PreprocessFinished => self.upload_job_timeout,
            Stage::UploadedJob => self.response_timeout,
            Stage::Finished => 0,
        };
        Duration::from_millis(ms)
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join(USER_CONFIG_FILE))
}

fn default_cache_file(name: &str) -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.cache_dir().join("fisk").join(name))
}

/// Switches recognized on the command line and stripped before the rest of
/// the argv is handed to the classifier. Everything unrecognized passes
/// through to the compiler untouched.
#[derive(Debug, Default)]
pub struct Options {
    pub verify: bool,
    pub version: bool,
    pub help: bool,
    pub dump_semaphores: bool,
    pub clean_semaphores: bool,
    pub debug: bool,
    pub verbose: bool,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_file_append: bool,
    pub delay: Option<u64>,
    pub disabled: bool,
    pub no_local: bool,
    pub no_desire: bool,
}

impl Options {
    /// Splits `argv` into recognized fisk switches and the remaining
    /// compiler command line (argv[0] preserved).
    pub fn parse(argv: &[String]) -> (Options, Vec<String>) {
        let mut options = Options::default();
        let mut rest = Vec::with_capacity(argv.len());
        let mut iter = argv.iter();
        if let Some(argv0) = iter.next() {
            rest.push(argv0.clone());
        }
        for arg in iter {
            // `--fisk-verify` and `--verify` are the same switch; the
            // prefixed spelling can't collide with real compiler flags.
            let flag = match arg.strip_prefix("--fisk-") {
                Some(rest) => format!("--{rest}"),
                None => arg.clone(),
            };
            match flag.as_str() {
                "--verify" => options.verify = true,
                "--version" => options.version = true,
                "--help" => options.help = true,
                "--dump-semaphores" => options.dump_semaphores = true,
                "--clean-semaphores" => options.clean_semaphores = true,
                "--debug" => options.debug = true,
                "--verbose" => options.verbose = true,
                "--log-file-append" => options.log_file_append = true,
                "--disabled" => options.disabled = true,
                "--no-local" => options.no_local = true,
                "--no-desire" => options.no_desire = true,
                _ => {
                    if let Some(level) = flag.strip_prefix("--log-level=") {
                        options.log_level = Some(level.to_string());
                    } else if let Some(file) = flag.strip_prefix("--log-file=") {
                        options.log_file = Some(PathBuf::from(file));
                    } else if let Some(ms) = flag.strip_prefix("--delay=") {
                        options.delay = ms.parse().ok();
                    } else {
                        rest.push(arg.clone());
                    }
                }
            }
        }
        (options, rest)
    }

    /// Folds command-line switches into the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if self.disabled {
            config.disabled = true;
        }
        if self.no_local {
            config.no_local = true;
        }
        if self.no_desire {
            config.no_desire = true;
        }
        if let Some(delay) = self.delay {
            config.delay = delay;
        }
        if let Some(level) = &self.log_level {
            config.log_level = Some(level.clone());
        }
        if let Some(file) = &self.log_file {
            config.log_file = Some(file.clone());
        }
        if self.log_file_append {
            config.log_file_append = true;
        }
    }
}

pub fn usage(program: &Path) {
    println!(
        "Usage: {} [compiler arguments...]\n\
         \n\
         fiskc is invoked in place of gcc/g++/clang/clang++ and decides per\n\
         invocation whether to compile locally or on a remote fisk builder.\n\
         \n\
         Recognized switches (stripped from the compiler command line):\n\
         \x20 --verify              handshake with the scheduler and exit\n\
         \x20 --version             print version\n\
         \x20 --help                this text\n\
         \x20 --dump-semaphores     print slot counts\n\
         \x20 --clean-semaphores    unlink the named semaphores\n\
         \x20 --debug | --verbose   log level shortcuts\n\
         \x20 --log-level=LEVEL     verbose, debug, warn, error or silent\n\
         \x20 --log-file=FILE       log to FILE\n\
         \x20 --log-file-append     append instead of truncating\n\
         \x20 --delay=MS            sleep before doing any work\n\
         \x20 --disabled            never go remote\n\
         \x20 --no-local            never prefer local\n\
         \x20 --no-desire           skip the desired-compile fast path",
        program.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_switches_and_keeps_compiler_args() {
        let argv: Vec<String> = ["fiskc", "--debug", "-c", "foo.c", "--log-level=warn", "-o", "foo.o"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (options, rest) = Options::parse(&argv);
        assert!(options.debug);
        assert_eq!(options.log_level.as_deref(), Some("warn"));
        assert_eq!(rest, vec!["fiskc", "-c", "foo.c", "-o", "foo.o"]);
    }

    #[test]
    fn fisk_prefixed_switches_are_aliases() {
        let argv: Vec<String> = ["g++", "--fisk-verify", "--fisk-delay=50", "-c", "a.cpp"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (options, rest) = Options::parse(&argv);
        assert!(options.verify);
        assert_eq!(options.delay, Some(50));
        assert_eq!(rest, vec!["g++", "-c", "a.cpp"]);
    }

    #[test]
    fn scheduler_url_normalization() {
        let mut config = Config::default();
        config.scheduler = "scheduler.example.com".to_string();
        assert_eq!(config.scheduler_url(), "ws://scheduler.example.com:8097");

        config.scheduler = "ws://10.0.0.1:9000".to_string();
        assert_eq!(config.scheduler_url(), "ws://10.0.0.1:9000");

        config.scheduler = "ws://host".to_string();
        assert_eq!(config.scheduler_url(), "ws://host:8097");
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.compile_slots >= 1);
        assert!(config.cpp_slots >= config.compile_slots);
        assert!(config.desired_compile_slots >= 1);
        assert!(config.watchdog);
        assert!(!config.object_cache);
    }
}
