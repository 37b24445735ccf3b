use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::client::ExecContext;
use crate::config::Config;
use crate::slots::{self, SlotKind};

/// The stations a remote compile passes through, in order. Each stage has
/// its own deadline; a stall at any of them abandons the remote attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Initial,
    ConnectedToScheduler,
    AcquiredBuilder,
    ConnectedToBuilder,
    PreprocessFinished,
    UploadedJob,
    Finished,
}

pub const STAGES: [Stage; 7] = [
    Stage::Initial,
    Stage::ConnectedToScheduler,
    Stage::AcquiredBuilder,
    Stage::ConnectedToBuilder,
    Stage::PreprocessFinished,
    Stage::UploadedJob,
    Stage::Finished,
];

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Initial => "Initial",
            Stage::ConnectedToScheduler => "ConnectedToScheduler",
            Stage::AcquiredBuilder => "AcquiredBuilder",
            Stage::ConnectedToBuilder => "ConnectedToBuilder",
            Stage::PreprocessFinished => "PreprocessFinished",
            Stage::UploadedJob => "UploadedJob",
            Stage::Finished => "Finished",
        }
    }
}

enum Command {
    Transition(Stage),
    Heartbeat,
    Stop,
}

/// Deadline supervisor on its own thread. When the current stage's budget
/// runs out it takes a compile slot and execs the compiler locally; the
/// process image is replaced, so no teardown is needed.
pub struct Watchdog {
    sender: Option<Sender<Command>>,
    thread: Option<thread::JoinHandle<()>>,
    started: Instant,
    timings: Arc<Mutex<Vec<(Stage, Instant)>>>,
    last_stage: Mutex<Stage>,
}

impl Watchdog {
    pub fn start(config: Arc<Config>, exec: ExecContext) -> Watchdog {
        let started = Instant::now();
        let timings = Arc::new(Mutex::new(Vec::new()));
        if !config.watchdog {
            debug!("Watchdog disabled");
            return Watchdog {
                sender: None,
                thread: None,
                started,
                timings,
                last_stage: Mutex::new(Stage::Initial),
            };
        }

        let (sender, receiver) = unbounded();
        let thread_config = Arc::clone(&config);
        let thread = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                let mut stage = Stage::Initial;
                loop {
                    let budget = thread_config.stage_timeout(stage);
                    match receiver.recv_timeout(budget) {
                        Ok(Command::Transition(next)) => {
                            if next == Stage::Finished {
                                return;
                            }
                            stage = next;
                        }
                        Ok(Command::Heartbeat) => {}
                        Ok(Command::Stop) => return,
                        Err(RecvTimeoutError::Disconnected) => return,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(
                                "Watchdog timed out in stage {} after {:?}",
                                stage.name(),
                                budget
                            );
                            let slot = slots::acquire(SlotKind::Compile, &thread_config);
                            crate::client::run_local(
                                &thread_config,
                                &exec,
                                Some(slot),
                                &format!("watchdog timeout in {}", stage.name()),
                            );
                        }
                    }
                }
            })
            .expect("failed to spawn watchdog thread");

        Watchdog {
            sender: Some(sender),
            thread: Some(thread),
            started,
            timings,
            last_stage: Mutex::new(Stage::Initial),
        }
    }

    /// Advances to `stage`. Transitions must be strictly monotonic.
    pub fn transition(&self, stage: Stage) {
        {
            let mut last = self.last_stage.lock().unwrap();
            debug_assert!(stage > *last, "watchdog went backwards to {}", stage.name());
            *last = stage;
        }
        debug!("Watchdog stage {}", stage.name());
        self.timings.lock().unwrap().push((stage, Instant::now()));
        if let Some(sender) = &self.sender {
            let _ = sender.send(Command::Transition(stage));
        }
    }

    /// Re-arms the current stage's deadline without advancing.
    pub fn heartbeat(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Command::Heartbeat);
        }
    }

    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Command::Stop);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Stage timestamps as milliseconds since the watchdog started, for
    /// the end-of-run report.
    pub fn timings(&self) -> Vec<(Stage, u64)> {
        self.timings
            .lock()
            .unwrap()
            .iter()
            .map(|(stage, at)| (*stage, at.duration_since(self.started).as_millis() as u64))
            .collect()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        for pair in STAGES.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn disabled_watchdog_records_timings() {
        let mut config = Config::default();
        config.watchdog = false;
        let mut watchdog = Watchdog::start(
            Arc::new(config),
            ExecContext {
                compiler: "/bin/true".into(),
                argv: vec!["true".to_string()],
            },
        );
        watchdog.transition(Stage::ConnectedToScheduler);
        watchdog.transition(Stage::AcquiredBuilder);
        let timings = watchdog.timings();
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[0].0, Stage::ConnectedToScheduler);
        assert!(timings[0].1 <= timings[1].1);
        watchdog.stop();
    }

    #[test]
    fn armed_watchdog_stops_cleanly_before_any_deadline() {
        let mut config = Config::default();
        config.scheduler_connect_timeout = 60_000;
        let mut watchdog = Watchdog::start(
            Arc::new(config),
            ExecContext {
                compiler: "/bin/true".into(),
                argv: vec!["true".to_string()],
            },
        );
        watchdog.transition(Stage::ConnectedToScheduler);
        watchdog.heartbeat();
        watchdog.stop();
    }
}
