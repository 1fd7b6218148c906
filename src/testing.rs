//! 测试用的内存实现：容器运行时与隧道控制面

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::env::{BuildConfig, EnvConfig, InstanceConfig, TunnelConfig};
use crate::domain::container::{ContainerState, InstanceSpec};
use crate::domain::deploy::LogLine;
use crate::infra::runtime::{ContainerRuntime, RuntimeError};
use crate::infra::tunnel_api::{
    ReservedAddress, ReservedDomain, TunnelApiError, TunnelControlPlane,
};

/// 内存中的实例
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub image: String,
    pub running: bool,
    /// 在重启策略下反复崩溃
    pub restarting: bool,
    pub host_ports: Vec<u16>,
    pub env: Vec<(String, String)>,
    pub extra_hosts: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// FakeRuntime 的可观察状态与故障注入开关
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub images: HashSet<String>,
    pub containers: HashMap<String, FakeContainer>,
    /// 运行时之外已经被占用的主机端口
    pub foreign_ports: Vec<u16>,

    pub pulls: Vec<String>,
    pub build_attempts: u32,
    pub create_calls: u32,
    pub stop_calls: u32,
    pub removed_images: Vec<String>,
    pub removed_containers: Vec<String>,
    /// 最近一次构建时上下文目录中的文件
    pub last_context_files: Vec<String>,

    /// 前 N 次构建失败
    pub failing_builds: u32,
    /// 构建“成功”但不产出 tag
    pub build_skips_tag: bool,
    pub fail_pull: bool,
    pub fail_create: bool,
    /// 指定名称的实例 start 失败
    pub fail_start_for: HashSet<String>,
    /// 指定名称的实例启动后立即退出
    pub exit_after_start: HashSet<String>,
    /// 指定名称的实例启动后进入崩溃重启循环
    pub restart_loop_for: HashSet<String>,
    pub fail_list_ports: bool,
    pub fail_stop: bool,
    pub fail_remove_container: bool,
}

/// 内存容器运行时
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    /// 预置一个正在运行的实例
    pub fn seed_container(&self, name: &str, host_ports: Vec<u16>) {
        self.seed_labeled_container(name, host_ports, &[]);
    }

    /// 预置一个带标签的运行实例
    pub fn seed_labeled_container(&self, name: &str, host_ports: Vec<u16>, labels: &[(&str, &str)]) {
        self.state().containers.insert(
            name.to_string(),
            FakeContainer {
                image: "seeded".to_string(),
                running: true,
                restarting: false,
                host_ports,
                env: Vec::new(),
                extra_hosts: Vec::new(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    /// 当前残留的资源数量 (images, containers)
    pub fn resource_counts(&self) -> (usize, usize) {
        let state = self.state();
        (state.images.len(), state.containers.len())
    }
}

fn failure(message: &str) -> RuntimeError {
    RuntimeError::Other(message.to_string())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        Ok(self.state().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.pulls.push(reference.to_string());
        if state.fail_pull {
            return Err(failure("pull access denied"));
        }
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        log_tx: broadcast::Sender<LogLine>,
    ) -> Result<(), RuntimeError> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(context_dir) {
            for entry in entries.flatten() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();

        let mut state = self.state();
        state.build_attempts += 1;
        state.last_context_files = files;
        let _ = log_tx.send(LogLine::stdout(format!("#1 building {}", tag)));

        if state.build_attempts <= state.failing_builds {
            let _ = log_tx.send(LogLine::stderr("ERROR: failed to solve"));
            return Err(failure("failed to solve: exit code 1"));
        }
        if !state.build_skips_tag {
            state.images.insert(tag.to_string());
        }
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.images.remove(reference);
        state.removed_images.push(reference.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.fail_create {
            return Err(failure("daemon refused create"));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(failure("Conflict. The container name is already in use"));
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                image: spec.image.clone(),
                running: false,
                restarting: false,
                host_ports: spec.port_bindings.iter().map(|b| b.host_port).collect(),
                env: spec
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                extra_hosts: spec.extra_hosts.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.fail_start_for.contains(name) {
            return Err(failure("Bind for 0.0.0.0 failed: port is already allocated"));
        }
        let exits = state.exit_after_start.contains(name);
        let loops = state.restart_loop_for.contains(name);
        match state.containers.get_mut(name) {
            Some(container) => {
                container.running = !exits;
                container.restarting = loops && !exits;
                Ok(())
            }
            None => Err(failure("No such container")),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        Ok(self.state().containers.get(name).map(|c| {
            let status = match (c.running, c.restarting) {
                (true, true) => "restarting",
                (true, false) => "running",
                (false, _) => "exited",
            };
            ContainerState {
                running: c.running,
                restarting: c.restarting,
                status: status.to_string(),
                exit_code: if c.running && !c.restarting { None } else { Some(1) },
                labels: c.labels.clone(),
            }
        }))
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.stop_calls += 1;
        if state.fail_stop {
            return Err(failure("stop timed out"));
        }
        if let Some(container) = state.containers.get_mut(name) {
            container.running = false;
            container.restarting = false;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if state.fail_remove_container {
            return Err(failure("removal already in progress"));
        }
        if state.containers.remove(name).is_none() {
            return Err(failure("No such container"));
        }
        state.removed_containers.push(name.to_string());
        Ok(())
    }

    async fn used_host_ports(&self) -> Result<Vec<u16>, RuntimeError> {
        let state = self.state();
        if state.fail_list_ports {
            return Err(failure("Cannot connect to the Docker daemon"));
        }
        let mut ports = state.foreign_ports.clone();
        for container in state.containers.values().filter(|c| c.running) {
            ports.extend(&container.host_ports);
        }
        Ok(ports)
    }
}

/// FakeTunnel 的可观察状态
#[derive(Debug, Default)]
pub struct TunnelState {
    pub next_id: u32,
    pub addresses: HashMap<String, String>,
    pub domains: HashMap<String, String>,
    pub released: Vec<String>,

    pub fail_reserve_address: bool,
    pub fail_reserve_domain: bool,
    pub fail_release: bool,
}

/// 内存隧道控制面
#[derive(Default)]
pub struct FakeTunnel {
    state: Mutex<TunnelState>,
}

impl FakeTunnel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap()
    }

    /// 仍处于预留状态的端点数量
    pub fn reserved_count(&self) -> usize {
        let state = self.state();
        state.addresses.len() + state.domains.len()
    }
}

fn rejected(message: &str) -> TunnelApiError {
    TunnelApiError::Rejected {
        status: 400,
        message: message.to_string(),
    }
}

#[async_trait]
impl TunnelControlPlane for FakeTunnel {
    async fn reserve_address(&self, _description: &str) -> Result<ReservedAddress, TunnelApiError> {
        let mut state = self.state();
        if state.fail_reserve_address {
            return Err(rejected("reserved address limit reached"));
        }
        state.next_id += 1;
        let id = format!("ra_{}", state.next_id);
        let addr = format!("1.tcp.ngrok.io:{}", 20000 + state.next_id);
        state.addresses.insert(id.clone(), addr.clone());
        Ok(ReservedAddress { id, addr })
    }

    async fn reserve_domain(
        &self,
        domain: &str,
        _description: &str,
    ) -> Result<ReservedDomain, TunnelApiError> {
        let mut state = self.state();
        if state.fail_reserve_domain {
            return Err(rejected("domain is already reserved by another account"));
        }
        state.next_id += 1;
        let id = format!("rd_{}", state.next_id);
        state.domains.insert(id.clone(), domain.to_string());
        Ok(ReservedDomain {
            id,
            domain: domain.to_string(),
        })
    }

    async fn release_address(&self, id: &str) -> Result<(), TunnelApiError> {
        let mut state = self.state();
        if state.fail_release {
            return Err(rejected("release failed"));
        }
        state.addresses.remove(id);
        state.released.push(id.to_string());
        Ok(())
    }

    async fn release_domain(&self, id: &str) -> Result<(), TunnelApiError> {
        let mut state = self.state();
        if state.fail_release {
            return Err(rejected("release failed"));
        }
        state.domains.remove(id);
        state.released.push(id.to_string());
        Ok(())
    }
}

/// 测试配置：构建目录放在临时目录下，等待时间为 0
pub fn test_config(build_root: &Path) -> EnvConfig {
    EnvConfig {
        api_key: "test-key".to_string(),
        port: 0,
        port_range: 30000..30100,
        build: BuildConfig {
            docker_bin: "docker".to_string(),
            build_root: build_root.to_path_buf(),
            max_retries: 2,
            build_timeout: Duration::from_secs(5),
            agent_install: "true".to_string(),
        },
        instance: InstanceConfig {
            stop_grace: Duration::from_secs(0),
            start_settle: Duration::from_millis(0),
        },
        tunnel: TunnelConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            api_key: "tunnel-key".to_string(),
            authtoken: "agent-token".to_string(),
            domain: "ngrok.app".to_string(),
            region: "us".to_string(),
        },
    }
}

/// 每个测试独立的构建目录
pub fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("deployify-test-{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
