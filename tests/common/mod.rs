//! Shared fixtures for integration tests: a scripted agent worker and a
//! config builder pointed at a temp directory.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use aios::domain::models::{AgentConfig, Task, Trace};
use aios::domain::ports::{AgentWorker, ExecutionResult, WorkerError};
use aios::infrastructure::config::AiosConfig;

/// One scripted behavior for an execution attempt.
#[derive(Debug, Clone)]
pub enum Script {
    /// Succeed after the delay.
    Succeed(Duration),
    /// Fail with the given error kind after the delay.
    FailWith(&'static str, Duration),
    /// Never return until cancelled.
    Hang,
}

/// Worker stub driven by per-description scripts. Each matching execution
/// pops the next script; an exhausted or unmatched description falls back to
/// the default script.
pub struct ScriptedWorker {
    scripts: Mutex<Vec<(String, VecDeque<Script>)>>,
    default: Script,
    pub calls: AtomicUsize,
    concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    started: Mutex<Vec<(String, Instant)>>,
    finished: Mutex<Vec<(String, Instant)>>,
    /// `Some(success)` makes the worker claim deterministic replay support.
    replay_success: Option<bool>,
}

impl ScriptedWorker {
    pub fn new(default: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(Vec::new()),
            default,
            calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            replay_success: None,
        })
    }

    pub fn with_replay(default: Script, replay_success: bool) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(Vec::new()),
            default,
            calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            replay_success: Some(replay_success),
        })
    }

    /// Queue scripts for tasks whose description contains `key`.
    pub fn script_for(&self, key: &str, scripts: impl IntoIterator<Item = Script>) {
        let mut table = self.scripts.lock().unwrap();
        if let Some((_, queue)) = table.iter_mut().find(|(k, _)| k == key) {
            queue.extend(scripts);
        } else {
            table.push((key.to_string(), scripts.into_iter().collect()));
        }
    }

    fn next_script(&self, description: &str) -> Script {
        let mut table = self.scripts.lock().unwrap();
        for (key, queue) in table.iter_mut() {
            if description.contains(key.as_str()) {
                if let Some(script) = queue.pop_front() {
                    return script;
                }
            }
        }
        self.default.clone()
    }

    /// Order in which task descriptions started executing.
    pub fn start_order(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(d, _)| d.clone())
            .collect()
    }

    pub fn started_at(&self, description: &str) -> Option<Instant> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .find(|(d, _)| d.contains(description))
            .map(|(_, t)| *t)
    }

    pub fn finished_at(&self, description: &str) -> Option<Instant> {
        self.finished
            .lock()
            .unwrap()
            .iter()
            .find(|(d, _)| d.contains(description))
            .map(|(_, t)| *t)
    }
}

#[async_trait]
impl AgentWorker for ScriptedWorker {
    async fn execute(
        &self,
        _agent: Arc<AgentConfig>,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.started
            .lock()
            .unwrap()
            .push((task.description.clone(), Instant::now()));

        let script = self.next_script(&task.description);
        let result = match script {
            Script::Succeed(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        Ok(ExecutionResult::ok(delay.as_millis() as u64))
                    }
                    () = cancel.cancelled() => {
                        Ok(ExecutionResult::failed(0, "cancelled", "stopped"))
                    }
                }
            }
            Script::FailWith(kind, delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        Ok(ExecutionResult::failed(delay.as_millis() as u64, kind, "scripted failure"))
                    }
                    () = cancel.cancelled() => {
                        Ok(ExecutionResult::failed(0, "cancelled", "stopped"))
                    }
                }
            }
            Script::Hang => {
                cancel.cancelled().await;
                Ok(ExecutionResult::failed(0, "cancelled", "stopped"))
            }
        };

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.finished
            .lock()
            .unwrap()
            .push((task.description.clone(), Instant::now()));
        result
    }

    fn supports_replay(&self) -> bool {
        self.replay_success.is_some()
    }

    async fn replay(
        &self,
        _agent: Arc<AgentConfig>,
        trace: &Trace,
    ) -> Result<ExecutionResult, WorkerError> {
        match self.replay_success {
            Some(true) => Ok(ExecutionResult::ok(trace.duration_ms)),
            Some(false) => Ok(ExecutionResult::failed(
                trace.duration_ms,
                "runtime_error:Replay",
                "replay regression",
            )),
            None => Err(WorkerError::ReplayUnsupported),
        }
    }
}

/// Config pointed at a temp directory with timings scaled for tests.
pub fn test_config(dir: &Path) -> AiosConfig {
    let mut config = AiosConfig::default();
    config.data_dir = dir.join("data").to_string_lossy().into_owned();
    config.playbooks_path = dir.join("playbooks.json").to_string_lossy().into_owned();
    config.retry.base_ms = 20;
    config.retry.cap_ms = 100;
    config.breaker.threshold = 3;
    config.breaker.cooldown_secs = 1;
    config
}

/// Poll until the condition holds or the deadline passes.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
