//! In-memory container runtime for pool tests.
//!
//! Tracks created containers, counts calls for assertions, and scripts exec
//! behaviour without touching a real daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, HealthProbe,
    RuntimeError,
};

/// Scripted result for one exec call.
#[derive(Debug, Clone)]
pub(crate) enum MockExec {
    /// Exit with the given code and stdout.
    Exit { code: i64, stdout: String },
    /// Block until [`MockRuntime::release`] is called, then exit 0.
    Block,
    /// Sleep for the duration, then exit 0.
    Sleep(Duration),
    /// Fail as if the runtime could not be reached.
    Unreachable,
    /// Fail as if the container disappeared.
    ContainerGone,
}

#[derive(Debug, Clone)]
pub(crate) struct MockContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub health: HealthProbe,
}

/// A configurable fake runtime.
#[derive(Default)]
pub(crate) struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    created_order: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    exec_script: Mutex<VecDeque<MockExec>>,
    default_exec: Mutex<Option<MockExec>>,
    orphans: Mutex<Vec<String>>,
    release: Notify,
    next_id: AtomicUsize,
    pub unreachable: AtomicBool,
    pub image_present: AtomicBool,
    pub fail_create: AtomicBool,
    pub pulls: AtomicUsize,
    pub inspects: AtomicUsize,
    pub execs: AtomicUsize,
    pub running_execs: AtomicUsize,
    pub kills: AtomicUsize,
    pub last_env: Mutex<Vec<(String, String)>>,
}

impl MockRuntime {
    /// A reachable runtime with the image present and exec exiting 0.
    pub fn new() -> Arc<Self> {
        let runtime = Self::default();
        runtime.image_present.store(true, Ordering::SeqCst);
        *runtime.default_exec.lock().unwrap() = Some(MockExec::Exit {
            code: 0,
            stdout: "ok".to_string(),
        });
        Arc::new(runtime)
    }

    /// Queue results for the next exec calls; afterwards the default applies.
    pub fn script(&self, results: impl IntoIterator<Item = MockExec>) {
        self.exec_script.lock().unwrap().extend(results);
    }

    /// Set the result used when the script is empty.
    pub fn set_default_exec(&self, exec: MockExec) {
        *self.default_exec.lock().unwrap() = Some(exec);
    }

    /// Release every exec blocked on [`MockExec::Block`].
    pub fn release(&self) {
        self.release.notify_waiters();
    }

    /// Simulate the main process of a container exiting.
    pub fn kill_container(&self, id: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.running = false;
        }
    }

    /// Simulate a failing health probe.
    pub fn set_health(&self, id: &str, health: HealthProbe) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.health = health;
        }
    }

    /// Pretend a labelled container survived a previous process.
    pub fn add_orphan(&self, id: &str) {
        self.orphans.lock().unwrap().push(id.to_string());
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    pub fn created(&self) -> Vec<String> {
        self.created_order.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn live_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RuntimeError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }

    fn next_exec(&self) -> MockExec {
        self.exec_script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.default_exec.lock().unwrap().clone())
            .unwrap_or(MockExec::Exit {
                code: 0,
                stdout: String::new(),
            })
    }

    async fn run_exec(&self, id: &str, script: MockExec) -> Result<ExecOutput, RuntimeError> {
        match script {
            MockExec::Exit { code, stdout } => Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: code,
            }),
            MockExec::Block => {
                self.release.notified().await;
                Ok(ExecOutput::default())
            }
            MockExec::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ExecOutput::default())
            }
            MockExec::Unreachable => Err(RuntimeError::unavailable("connection refused")),
            MockExec::ContainerGone => Err(RuntimeError::container_not_found(id)),
        }
    }
}

/// Decrements the running-exec gauge and counts kills of unfinished execs.
struct ExecGuard<'a> {
    runtime: &'a MockRuntime,
    finished: bool,
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.runtime.running_execs.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.runtime.kills.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_reachable()
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        self.check_reachable()?;
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_reachable()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::operation_failed("create failed"));
        }
        let id = format!("{name}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
                health: HealthProbe::None,
            },
        );
        self.created_order.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        match self.containers.lock().unwrap().get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::container_not_found(id)),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        match self.containers.lock().unwrap().get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::container_not_found(id)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        let existed = self.containers.lock().unwrap().remove(id).is_some();
        let orphan = {
            let mut orphans = self.orphans.lock().unwrap();
            let before = orphans.len();
            orphans.retain(|o| o != id);
            orphans.len() != before
        };
        if existed || orphan {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        } else {
            Err(RuntimeError::container_not_found(id))
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        self.check_reachable()?;
        self.inspects.fetch_add(1, Ordering::SeqCst);
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(id)
            .ok_or_else(|| RuntimeError::container_not_found(id))?;
        Ok(ContainerStatus {
            running: c.running,
            health: c.health,
            status: if c.running { "running" } else { "exited" }.to_string(),
        })
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        self.check_reachable()?;
        self.execs.fetch_add(1, Ordering::SeqCst);
        *self.last_env.lock().unwrap() = request
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let script = self.next_exec();

        self.running_execs.fetch_add(1, Ordering::SeqCst);
        let mut guard = ExecGuard {
            runtime: self,
            finished: false,
        };

        let result = match tokio::time::timeout(request.timeout, self.run_exec(id, script)).await {
            Ok(result) => result,
            Err(_) => {
                self.kills.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::timeout(request.timeout))
            }
        };
        guard.finished = true;
        result
    }

    async fn list_labeled(&self, _label: &str, _value: &str) -> Result<Vec<String>, RuntimeError> {
        self.check_reachable()?;
        Ok(self.orphans.lock().unwrap().clone())
    }
}
