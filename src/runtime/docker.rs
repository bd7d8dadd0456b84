//! Docker implementation of [`ContainerRuntime`] on top of bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HealthStatusEnum, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, HealthProbe,
    RuntimeError, TASK_SCRATCH_DIR,
};

/// Seconds a container gets to exit before it is killed on stop.
const STOP_GRACE_SECS: i64 = 5;

/// Runs sandboxes as Docker containers.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using the default socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::unavailable(format!("Failed to connect to Docker: {e}"))
        })?;
        Ok(Self { docker })
    }

    /// Wrap an existing bollard client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn collect_exec(&self, id: &str, exec_id: &str) -> Result<ExecOutput, RuntimeError> {
        let mut output = ExecOutput::default();

        match self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(|e| map_error(e, id))?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = %id, "Error reading exec output: {}", e);
                            return Err(map_error(e, id));
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::operation_failed(
                    "exec started detached, no output attached",
                ));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| map_error(e, id))?;
        output.exit_code = inspect
            .exit_code
            .ok_or_else(|| RuntimeError::operation_failed("exec finished without an exit code"))?;

        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(|e| {
            RuntimeError::unavailable(format!("Cannot ping Docker daemon: {e}"))
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(e, image)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!("Pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(RuntimeError::operation_failed(format!(
                            "Docker pull error: {error}"
                        )));
                    }
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", image, status.trim());
                    }
                }
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(RuntimeError::image_not_found(image)),
                Err(e) => return Err(map_error(e, image)),
            }
        }

        info!("Image pulled: {}", image);
        Ok(())
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        debug!("Creating container: {}", name);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::image_not_found(&spec.image),
                other => map_error(other, name),
            })?;

        for warning in &response.warnings {
            warn!(container = %name, "Docker create warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| map_error(e, id))
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            // 304: already stopped
            Ok(())
            | Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error(e, id)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error(e, id))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(e, id))?;

        let state = info.state.unwrap_or_default();
        let health = match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => HealthProbe::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthProbe::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthProbe::Starting,
            _ => HealthProbe::None,
        };

        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            health,
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
        })
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        let pid_file = pid_file(&request.task_id);

        // Record the task's PID on the scratch tmpfs so it can be killed
        // without touching anything else running in the container.
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {pid_file} 2>/dev/null; exec \"$@\""),
            "warden-task".to_string(),
        ];
        cmd.extend(request.command.iter().cloned());

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_error(e, id))?;

        let mut killer = KillOnDrop {
            docker: self.docker.clone(),
            container: id.to_string(),
            pid_file,
            armed: true,
        };

        match tokio::time::timeout(request.timeout, self.collect_exec(id, &exec.id)).await {
            Ok(Ok(output)) => {
                killer.armed = false;
                Ok(output)
            }
            // The guard still fires: the process may outlive a broken stream.
            Ok(Err(e)) => Err(e),
            Err(_) => {
                killer.armed = false;
                warn!(container = %id, task_id = %request.task_id, "Task timed out, killing its process");
                kill_task(&self.docker, id, &killer.pid_file).await;
                Err(RuntimeError::timeout(request.timeout))
            }
        }
    }

    async fn list_labeled(&self, label: &str, value: &str) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{label}={value}")]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_error(e, label))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    HostConfig {
        binds: Some(spec.binds.clone()),
        memory: Some(spec.memory_bytes),
        nano_cpus: Some(spec.nano_cpus),
        pids_limit: Some(spec.pids_limit),
        security_opt: Some(spec.security_opt.clone()),
        cap_drop: Some(spec.cap_drop.clone()),
        readonly_rootfs: Some(spec.read_only_rootfs),
        tmpfs: Some(spec.tmpfs.clone()),
        network_mode: spec.network_disabled.then(|| "none".to_string()),
        init: Some(true),
        ..Default::default()
    }
}

/// Map a bollard error to a runtime error. `subject` names the container,
/// image or filter the call was about.
fn map_error(err: BollardError, subject: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::container_not_found(subject),
        // 409: container is not running (paused, restarting, exited)
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::container_unhealthy(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::operation_failed(format!("{status_code}: {message}")),
        other => RuntimeError::unavailable(other.to_string()),
    }
}

/// PID file path for one exec of a task, restricted to shell-safe
/// characters. The random suffix keeps task IDs that sanitize alike apart.
fn pid_file(task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{TASK_SCRATCH_DIR}/warden-{safe}-{}.pid", &nonce[..12])
}

async fn kill_task(docker: &Docker, container: &str, pid_file: &str) {
    let script = format!("kill -KILL \"$(cat {pid_file})\" 2>/dev/null; rm -f {pid_file}");
    let exec = match docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
    {
        Ok(exec) => exec,
        Err(e) => {
            debug!(container = %container, "Failed to create kill exec: {}", e);
            return;
        }
    };

    match docker.start_exec(&exec.id, None).await {
        Ok(StartExecResults::Attached { mut output, .. }) => {
            while output.next().await.is_some() {}
        }
        Ok(StartExecResults::Detached) => {}
        Err(e) => debug!(container = %container, "Failed to kill task process: {}", e),
    }
}

/// Kills the task process when an exec future is dropped before it finishes.
struct KillOnDrop {
    docker: Docker,
    container: String,
    pid_file: String,
    armed: bool,
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let docker = self.docker.clone();
        let container = std::mem::take(&mut self.container);
        let pid_file = std::mem::take(&mut self.pid_file);
        handle.spawn(async move {
            kill_task(&docker, &container, &pid_file).await;
        });
    }
}
