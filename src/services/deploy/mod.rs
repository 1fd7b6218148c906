//! 部署编排
//!
//! 一次请求 = 一个 tokio 任务，步骤严格串行：
//! 校验 → 名称检查 → 端口分配 → 端点预留 → 构建上下文 → 镜像构建 → 实例启动。
//! 名称检查之后的任何失败都会按 `RollbackLedger` 撤销已获取的资源，再返回原始错误。

pub mod artifacts;
pub mod context;
pub mod phase;
pub mod rollback;
pub mod validate;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::env::constants::NAME_PREFIX;
use crate::config::env::EnvConfig;
use crate::domain::container::{InstanceRecord, InstanceSpec, PortBinding};
use crate::domain::deploy::{
    DataServiceRequest, DataServiceResponse, DecodedFile, DeployPhase, DeployRequest,
    DeployResponse, DeployStage, DeployStatus, DeploymentKind, DeploymentRecord, LogLine,
};
use crate::domain::tunnel::{TunnelEndpoint, TunnelKind};
use crate::error::DeployError;
use crate::infra::runtime::ContainerRuntime;
use crate::infra::tunnel_api::TunnelControlPlane;
use crate::services::allocator::PortAllocator;
use crate::services::data_profiles::{generate_password, DataServiceRegistry, TemplateValues};
use crate::services::image::ImageProvisioner;
use crate::services::instance::InstanceLifecycle;
use crate::services::profiles::ProfileRegistry;
use crate::services::progress::{ProgressChannel, ProgressReporter};
use crate::services::tunnel::TunnelProvisioner;
use crate::state::{DeploymentStore, SessionRegistry};

use self::artifacts::{render_dockerfile, render_start_script, DockerfileSpec, StartScript};
use self::context::GeneratedArtifacts;

pub use phase::PhaseTracker;
pub use rollback::{RollbackLedger, RollbackReport};

/// 应用源码在镜像中的目录
const APP_WORKDIR: &str = "/app";
/// 数据服务 / 管理界面镜像中放生成文件的目录
const SERVICE_WORKDIR: &str = "/deployify";
/// 管理界面访问宿主机端口用的主机名
const HOST_GATEWAY: &str = "host.docker.internal";
/// 构建日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 1024;

/// `deployify-{name}`，同时用作镜像 tag
pub fn instance_name(name: &str) -> String {
    format!("{}-{}", NAME_PREFIX, name)
}

/// 编排器设置
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub build_root: PathBuf,
    pub max_retries: u32,
    pub start_settle: Duration,
    pub agent_install: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            build_root: config.build.build_root.clone(),
            max_retries: config.build.max_retries,
            start_settle: config.instance.start_settle,
            agent_install: config.build.agent_install.clone(),
        }
    }
}

/// teardown 结果
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub name: String,
    pub instances: Vec<String>,
    pub endpoints_released: usize,
    pub images_removed: usize,
}

/// 在途名称占用，drop 时释放
struct NameClaim {
    names: Vec<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        for name in &self.names {
            in_flight.remove(name);
        }
    }
}

/// 单个实例流水线的输入
struct InstancePlan {
    label: Option<&'static str>,
    instance: String,
    base_image: String,
    workdir: &'static str,
    files: Vec<DecodedFile>,
    install_step: Option<String>,
    command: String,
    internal_port: u16,
    endpoint_kind: TunnelKind,
    env: BTreeMap<String, String>,
    extra_hosts: Vec<String>,
}

/// 单个实例流水线的产出
struct ProvisionedInstance {
    record: InstanceRecord,
    endpoint: TunnelEndpoint,
    internal_port: u16,
    exposed_port: u16,
    build_attempts: u32,
}

/// 一次请求的运行状态
struct DeployRun {
    id: String,
    reporter: ProgressReporter,
    ledger: RollbackLedger,
    /// 本次请求已经拿到的端口
    taken_ports: Vec<u16>,
    /// 已完成实例的阶段记录
    prior_stages: Vec<DeployStage>,
}

impl DeployRun {
    fn new(reporter: ProgressReporter) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            reporter,
            ledger: RollbackLedger::new(),
            taken_ports: Vec::new(),
            prior_stages: Vec::new(),
        }
    }
}

/// 部署编排器
pub struct DeploymentOrchestrator {
    profiles: ProfileRegistry,
    data_services: DataServiceRegistry,
    allocator: PortAllocator,
    tunnels: TunnelProvisioner,
    images: ImageProvisioner,
    instances: InstanceLifecycle,
    progress: ProgressChannel,
    store: Arc<DeploymentStore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    settings: OrchestratorSettings,
}

impl DeploymentOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        control_plane: Arc<dyn TunnelControlPlane>,
        sessions: Arc<SessionRegistry>,
        store: Arc<DeploymentStore>,
        config: &EnvConfig,
    ) -> Self {
        Self {
            profiles: ProfileRegistry::builtin(),
            data_services: DataServiceRegistry::builtin(),
            allocator: PortAllocator::new(runtime.clone(), config.port_range.clone()),
            tunnels: TunnelProvisioner::new(control_plane, &config.tunnel),
            images: ImageProvisioner::new(runtime.clone()),
            instances: InstanceLifecycle::new(runtime, config.instance.stop_grace),
            progress: ProgressChannel::new(sessions),
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            settings: OrchestratorSettings::from_config(config),
        }
    }

    /// 支持的语言
    pub fn languages(&self) -> Vec<String> {
        self.profiles.languages()
    }

    /// 正在处理的名称数量
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    // ========== 单实例应用 ==========

    /// 部署上传的源码
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeployResponse, DeployError> {
        let reporter = self.progress.reporter(request.session_id.clone());

        let plan = match self.plan_app(&request) {
            Ok(plan) => plan,
            Err(e) => return Err(reject(&reporter, &request.name, e).await),
        };
        let _claim = match self.claim_names(&[plan.instance.clone()]).await {
            Ok(claim) => claim,
            Err(e) => return Err(reject(&reporter, &request.name, e).await),
        };

        let mut run = DeployRun::new(reporter);
        self.store
            .insert(DeploymentRecord::new(
                run.id.clone(),
                request.name.clone(),
                DeploymentKind::App,
            ))
            .await;
        info!(
            deployment_id = %run.id,
            name = %request.name,
            language = %request.language,
            files = request.files.len(),
            "Deployment started"
        );

        let mut tracker = PhaseTracker::new(None);
        let outcome = self.provision_app(&mut run, &mut tracker, plan).await;
        let instance = match outcome {
            Ok(instance) => instance,
            Err(e) => {
                tracker.fail(&e.to_string());
                return Err(self.abort(run, &[&tracker], e).await);
            }
        };

        let url = instance.endpoint.public_url();
        self.succeed(&mut run, tracker.stages().to_vec(), &url).await;
        info!(
            deployment_id = %run.id,
            instance = %instance.record.name,
            url = %url,
            build_attempts = instance.build_attempts,
            "Deployment succeeded"
        );

        Ok(DeployResponse {
            url,
            internal_port: instance.internal_port,
            exposed_port: instance.exposed_port,
            deployment_id: run.id,
        })
    }

    fn plan_app(&self, request: &DeployRequest) -> Result<InstancePlan, DeployError> {
        validate::validate_name(&request.name)?;
        let profile = self.profiles.resolve(&request.language)?;
        let files = validate::decode_files(&request.files)?;
        validate::validate_env(&request.env)?;

        let internal_port = profile.detect_port(&files);
        let command = profile.start_command(request.run_command.as_deref());
        debug!(
            name = %request.name,
            language = %profile.language,
            internal_port,
            command = %command,
            "Resolved build profile"
        );

        Ok(InstancePlan {
            label: None,
            instance: instance_name(&request.name),
            base_image: profile.base_image.clone(),
            workdir: APP_WORKDIR,
            files,
            install_step: profile.install_step.clone(),
            command,
            internal_port,
            endpoint_kind: TunnelKind::Http,
            env: request.env.clone(),
            extra_hosts: Vec::new(),
        })
    }

    async fn provision_app(
        &self,
        run: &mut DeployRun,
        tracker: &mut PhaseTracker,
        plan: InstancePlan,
    ) -> Result<ProvisionedInstance, DeployError> {
        tracker.advance(DeployPhase::NameChecked)?;
        let reporter = run.reporter.clone();
        reporter
            .report(
                DeployPhase::NameChecked.percentage(),
                &format!("Name {} is available", plan.instance),
            )
            .await;

        let instance = self.provision_instance(run, tracker, &reporter, plan).await?;
        tracker.advance(DeployPhase::Succeeded)?;
        Ok(instance)
    }

    // ========== 数据服务 + 管理界面 ==========

    /// 部署数据服务及其管理界面
    ///
    /// 两个实例共用一本回滚账本：第二个实例失败时第一个实例也会被撤销
    pub async fn deploy_data_service(
        &self,
        request: DataServiceRequest,
    ) -> Result<DataServiceResponse, DeployError> {
        let reporter = self.progress.reporter(request.session_id.clone());

        let profile = match validate::validate_name(&request.name)
            .and_then(|_| self.data_services.resolve(&request.engine))
        {
            Ok(profile) => profile,
            Err(e) => return Err(reject(&reporter, &request.name, e).await),
        };
        let base = instance_name(&request.name);
        let db_name = format!("{}-db", base);
        let admin_name = format!("{}-admin", base);
        let _claim = match self
            .claim_names(&[db_name.clone(), admin_name.clone()])
            .await
        {
            Ok(claim) => claim,
            Err(e) => return Err(reject(&reporter, &request.name, e).await),
        };

        let mut run = DeployRun::new(reporter);
        self.store
            .insert(DeploymentRecord::new(
                run.id.clone(),
                request.name.clone(),
                DeploymentKind::DataService,
            ))
            .await;
        info!(
            deployment_id = %run.id,
            name = %request.name,
            engine = %profile.engine,
            "Data service deployment started"
        );

        let mut db_tracker = PhaseTracker::new(Some("db"));
        let mut admin_tracker = PhaseTracker::new(Some("admin"));
        let password = generate_password();

        let outcome = async {
            db_tracker.advance(DeployPhase::NameChecked)?;
            admin_tracker.advance(DeployPhase::NameChecked)?;

            let db_reporter = run.reporter.scoped(0, 50);
            db_reporter
                .report(
                    DeployPhase::NameChecked.percentage(),
                    &format!("Names {} and {} are available", db_name, admin_name),
                )
                .await;

            let db_values = TemplateValues {
                password: password.clone(),
                address: String::new(),
                host: HOST_GATEWAY.to_string(),
                port: profile.port,
            };
            let db_plan = InstancePlan {
                label: Some("db"),
                instance: db_name.clone(),
                base_image: profile.image.clone(),
                workdir: SERVICE_WORKDIR,
                files: Vec::new(),
                install_step: None,
                command: profile.service_command(&db_values),
                internal_port: profile.port,
                endpoint_kind: TunnelKind::Tcp,
                env: profile.service_env(&db_values),
                extra_hosts: Vec::new(),
            };
            let db = self
                .provision_instance(&mut run, &mut db_tracker, &db_reporter, db_plan)
                .await?;
            run.prior_stages.extend(db_tracker.stages().iter().cloned());

            let values = TemplateValues {
                password: password.clone(),
                address: db.endpoint.target.clone(),
                host: HOST_GATEWAY.to_string(),
                port: db.exposed_port,
            };
            let admin_reporter = run.reporter.scoped(50, 100);
            let admin_plan = InstancePlan {
                label: Some("admin"),
                instance: admin_name.clone(),
                base_image: profile.admin.image.clone(),
                workdir: SERVICE_WORKDIR,
                files: Vec::new(),
                install_step: None,
                command: profile.admin.command.clone(),
                internal_port: profile.admin.port,
                endpoint_kind: TunnelKind::Http,
                env: profile.admin_env(&values),
                extra_hosts: vec![format!("{}:host-gateway", HOST_GATEWAY)],
            };
            let admin = self
                .provision_instance(&mut run, &mut admin_tracker, &admin_reporter, admin_plan)
                .await?;

            db_tracker.advance(DeployPhase::Succeeded)?;
            admin_tracker.advance(DeployPhase::Succeeded)?;
            Ok::<_, DeployError>((db, admin, values))
        }
        .await;

        let (db, admin, values) = match outcome {
            Ok(provisioned) => provisioned,
            Err(e) => {
                if db_tracker.failed_stage().is_none() && admin_tracker.failed_stage().is_none() {
                    admin_tracker.fail(&e.to_string());
                }
                return Err(self.abort(run, &[&db_tracker, &admin_tracker], e).await);
            }
        };

        let admin_url = admin.endpoint.public_url();
        let mut stages = db_tracker.stages().to_vec();
        stages.extend(admin_tracker.stages().iter().cloned());
        self.succeed(&mut run, stages, &admin_url).await;
        info!(
            deployment_id = %run.id,
            data_instance = %db.record.name,
            admin_instance = %admin.record.name,
            address = %db.endpoint.target,
            admin_url = %admin_url,
            "Data service deployment succeeded"
        );

        Ok(DataServiceResponse {
            connection_url: profile.connection_url(&values),
            admin_url,
            data_port: db.exposed_port,
            admin_port: admin.exposed_port,
            deployment_id: run.id,
        })
    }

    // ========== Teardown ==========

    /// 移除一个部署的实例、镜像和端点；重复调用是安全的
    pub async fn teardown(&self, name: &str) -> Result<TeardownReport, DeployError> {
        validate::validate_name(name)?;
        let base = instance_name(name);
        let candidates = vec![
            base.clone(),
            format!("{}-db", base),
            format!("{}-admin", base),
        ];
        let _claim = self.claim_in_flight(&candidates)?;

        let live = self.store.latest_live(name).await;
        let (instances, endpoints) = match &live {
            Some(record) => (record.instances.clone(), record.endpoints.clone()),
            None => self.recover_from_labels(&candidates).await?,
        };

        let mut ledger = RollbackLedger::new();
        for endpoint in endpoints {
            ledger.record_endpoint(endpoint);
        }
        for instance in &instances {
            ledger.record_instance(instance.clone());
            ledger.record_image(instance.clone());
        }
        let report = ledger
            .unwind(&self.tunnels, &self.instances, &self.images)
            .await;

        if report.failures > 0 {
            warn!(name = %name, failures = report.failures, "Teardown incomplete");
            return Err(DeployError::upstream(format!(
                "{} resource(s) of {} could not be released",
                report.failures, name
            )));
        }

        if let Some(record) = live {
            self.store
                .update(&record.id, |r| r.status = DeployStatus::Removed)
                .await;
        }
        info!(name = %name, instances = instances.len(), "Deployment removed");

        Ok(TeardownReport {
            name: name.to_string(),
            instances,
            endpoints_released: report.endpoints_released,
            images_removed: report.images_removed,
        })
    }

    /// 记录已不在 store 中时，从实例标签找回端点预留
    ///
    /// 任何实例找不回端点都直接报错，不动任何资源
    async fn recover_from_labels(
        &self,
        candidates: &[String],
    ) -> Result<(Vec<String>, Vec<TunnelEndpoint>), DeployError> {
        let mut present = Vec::new();
        let mut endpoints = Vec::new();
        for candidate in candidates {
            let Some(state) = self.instances.inspect(candidate).await? else {
                continue;
            };
            let endpoint = TunnelEndpoint::from_labels(&state.labels).ok_or_else(|| {
                DeployError::upstream(format!(
                    "{} carries no endpoint labels; its reservation must be released manually",
                    candidate
                ))
            })?;
            debug!(instance = %candidate, endpoint = %endpoint.target, "Recovered endpoint from labels");
            present.push(candidate.clone());
            endpoints.push(endpoint);
        }
        Ok((present, endpoints))
    }

    // ========== 流水线 ==========

    /// 单个实例：端口 → 端点 → 上下文 → 镜像 → 实例；失败时标记 tracker
    async fn provision_instance(
        &self,
        run: &mut DeployRun,
        tracker: &mut PhaseTracker,
        reporter: &ProgressReporter,
        plan: InstancePlan,
    ) -> Result<ProvisionedInstance, DeployError> {
        let result = self.provision_steps(run, tracker, reporter, plan).await;
        if let Err(e) = &result {
            tracker.fail(&e.to_string());
        }
        result
    }

    async fn provision_steps(
        &self,
        run: &mut DeployRun,
        tracker: &mut PhaseTracker,
        reporter: &ProgressReporter,
        plan: InstancePlan,
    ) -> Result<ProvisionedInstance, DeployError> {
        let instance = plan.instance.clone();

        // Port
        let exposed_port = self.allocator.allocate_excluding(&run.taken_ports).await?;
        run.taken_ports.push(exposed_port);
        tracker.advance(DeployPhase::PortAllocated)?;
        reporter
            .report(
                DeployPhase::PortAllocated.percentage(),
                &format!("Allocated port {}", exposed_port),
            )
            .await;
        self.checkpoint(run, tracker).await;

        // Endpoint
        let endpoint = self.tunnels.reserve(plan.endpoint_kind, &instance).await?;
        run.ledger.record_endpoint(endpoint.clone());
        tracker.advance(DeployPhase::EndpointReserved)?;
        reporter
            .report(
                DeployPhase::EndpointReserved.percentage(),
                &format!("Reserved {}", endpoint.public_url()),
            )
            .await;
        self.checkpoint(run, tracker).await;

        // Build context
        let dir = context::context_dir(&self.settings.build_root, &instance);
        run.ledger.record_context(dir.clone());
        let artifacts = self.render_artifacts(&plan, &endpoint, exposed_port);
        context::materialize(&dir, &plan.files, &artifacts).await?;
        tracker.advance(DeployPhase::ContextMaterialized)?;
        reporter
            .report(
                DeployPhase::ContextMaterialized.percentage(),
                "Build context ready",
            )
            .await;

        // Image
        self.images.ensure_base_image(&plan.base_image).await?;
        run.ledger.record_image(instance.clone());
        self.checkpoint(run, tracker).await;
        let build_attempts = self.build_image(&dir, &instance, reporter).await?;
        tracker.advance(DeployPhase::ImageBuilt)?;
        reporter
            .report(
                DeployPhase::ImageBuilt.percentage(),
                &format!("Image {} built", instance),
            )
            .await;

        // Instance
        let mut env = plan.env;
        env.insert("PORT".to_string(), plan.internal_port.to_string());
        let spec = InstanceSpec {
            name: instance.clone(),
            image: instance.clone(),
            port_bindings: vec![PortBinding::new(exposed_port, exposed_port)],
            env,
            labels: self.labels(&run.id, &instance, plan.label, &endpoint),
            extra_hosts: plan.extra_hosts,
        };
        run.ledger.record_instance(instance.clone());
        self.checkpoint(run, tracker).await;
        let record = self.instances.create_and_start(&spec).await?;
        self.instances
            .verify_running(&instance, self.settings.start_settle)
            .await?;
        tracker.advance(DeployPhase::InstanceStarted)?;
        reporter
            .report(
                DeployPhase::InstanceStarted.percentage(),
                &format!("Instance {} is running", instance),
            )
            .await;
        self.checkpoint(run, tracker).await;

        Ok(ProvisionedInstance {
            record,
            endpoint,
            internal_port: plan.internal_port,
            exposed_port,
            build_attempts,
        })
    }

    fn render_artifacts(
        &self,
        plan: &InstancePlan,
        endpoint: &TunnelEndpoint,
        exposed_port: u16,
    ) -> GeneratedArtifacts {
        GeneratedArtifacts {
            dockerfile: render_dockerfile(&DockerfileSpec {
                base_image: &plan.base_image,
                workdir: plan.workdir,
                copy_sources: !plan.files.is_empty(),
                install_step: plan.install_step.as_deref(),
                agent_install: &self.settings.agent_install,
                internal_port: plan.internal_port,
                exposed_port,
            }),
            start_script: render_start_script(&StartScript {
                workdir: plan.workdir,
                command: &plan.command,
                internal_port: plan.internal_port,
                exposed_port,
            }),
            agent_config: self.tunnels.agent_config(endpoint, plan.internal_port),
        }
    }

    /// 构建镜像，构建输出以当前百分比转发给观察者
    async fn build_image(
        &self,
        dir: &Path,
        tag: &str,
        reporter: &ProgressReporter,
    ) -> Result<u32, DeployError> {
        let (log_tx, mut log_rx) = broadcast::channel::<LogLine>(LOG_CHANNEL_CAPACITY);
        let forward = reporter.clone();
        let drain = tokio::spawn(async move {
            loop {
                match log_rx.recv().await {
                    Ok(line) => forward.log(&line.content).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Build log forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let result = self
            .images
            .build(dir, tag, self.settings.max_retries, log_tx)
            .await;
        if let Err(e) = drain.await {
            warn!(error = %e, "Build log forwarder failed");
        }
        result
    }

    fn labels(
        &self,
        deployment_id: &str,
        instance: &str,
        role: Option<&str>,
        endpoint: &TunnelEndpoint,
    ) -> BTreeMap<String, String> {
        let mut labels = endpoint.to_labels();
        labels.insert(format!("{}.deployment", NAME_PREFIX), deployment_id.to_string());
        labels.insert(format!("{}.instance", NAME_PREFIX), instance.to_string());
        labels.insert(
            format!("{}.role", NAME_PREFIX),
            role.unwrap_or("app").to_string(),
        );
        labels
    }

    // ========== 名称占用 ==========

    fn claim_in_flight(&self, names: &[String]) -> Result<NameClaim, DeployError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(busy) = names.iter().find(|n| in_flight.contains(*n)) {
            return Err(DeployError::conflict(format!(
                "{} is already being deployed",
                busy
            )));
        }
        for name in names {
            in_flight.insert(name.clone());
        }
        Ok(NameClaim {
            names: names.to_vec(),
            in_flight: self.in_flight.clone(),
        })
    }

    /// 名称检查：进程内占用 + 运行时中不存在同名实例
    async fn claim_names(&self, names: &[String]) -> Result<NameClaim, DeployError> {
        let claim = self.claim_in_flight(names)?;
        for name in names {
            if self.instances.exists(name).await? {
                return Err(DeployError::conflict(format!(
                    "an instance named {} already exists",
                    name
                )));
            }
        }
        Ok(claim)
    }

    // ========== 记录 ==========

    async fn checkpoint(&self, run: &DeployRun, tracker: &PhaseTracker) {
        let mut stages = run.prior_stages.clone();
        stages.extend(tracker.stages().iter().cloned());
        let phase = tracker.current();
        let instances = run.ledger.instances().to_vec();
        let images = run.ledger.images().to_vec();
        let endpoints = run.ledger.endpoints().to_vec();
        self.store
            .update(&run.id, move |r| {
                r.phase = phase;
                r.stages = stages;
                r.instances = instances;
                r.images = images;
                r.endpoints = endpoints;
            })
            .await;
    }

    async fn succeed(&self, run: &mut DeployRun, stages: Vec<DeployStage>, url: &str) {
        run.ledger.discard_contexts().await;

        let instances = run.ledger.instances().to_vec();
        let images = run.ledger.images().to_vec();
        let endpoints = run.ledger.endpoints().to_vec();
        let url = url.to_string();
        let url_message = url.clone();
        self.store
            .update(&run.id, move |r| {
                r.status = DeployStatus::Succeeded;
                r.phase = DeployPhase::Succeeded;
                r.stages = stages;
                r.instances = instances;
                r.images = images;
                r.endpoints = endpoints;
                r.url = Some(url);
            })
            .await;

        run.reporter.complete(&format!("Deployed at {}", url_message)).await;
    }

    /// 回滚并记录失败，返回原始错误
    async fn abort(
        &self,
        run: DeployRun,
        trackers: &[&PhaseTracker],
        error: DeployError,
    ) -> DeployError {
        let failed_stage = trackers.iter().find_map(|t| t.failed_stage());
        let phase = trackers
            .iter()
            .find(|t| t.failed_stage().is_some())
            .or(trackers.last())
            .map_or(DeployPhase::Validating, |t| t.current());
        let stages: Vec<DeployStage> = trackers
            .iter()
            .flat_map(|t| t.stages().iter().cloned())
            .collect();

        error!(
            deployment_id = %run.id,
            stage = failed_stage.map_or("unknown", |s| s.as_str()),
            error = %error,
            "Deployment failed, rolling back"
        );

        let DeployRun {
            id,
            reporter,
            ledger,
            ..
        } = run;
        let instances = ledger.instances().to_vec();
        let images = ledger.images().to_vec();
        let endpoints = ledger.endpoints().to_vec();
        let report = ledger
            .unwind(&self.tunnels, &self.instances, &self.images)
            .await;
        if report.failures > 0 {
            warn!(deployment_id = %id, failures = report.failures, "Rollback left resources behind");
        }

        let message = error.to_string();
        self.store
            .update(&id, |r| {
                r.status = DeployStatus::Failed;
                r.phase = phase;
                r.failed_stage = failed_stage;
                r.error = Some(message.clone());
                r.stages = stages;
                r.instances = instances;
                r.images = images;
                r.endpoints = endpoints;
            })
            .await;

        reporter.fail(&message).await;
        error
    }
}

/// 请求在获取任何资源之前被拒绝
async fn reject(reporter: &ProgressReporter, name: &str, error: DeployError) -> DeployError {
    warn!(name = %name, code = error.code(), error = %error, "Deployment rejected");
    reporter.fail(&error.to_string()).await;
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::SourceFile;
    use crate::domain::progress::ProgressEvent;
    use crate::testing::{scratch_dir, test_config, FakeRuntime, FakeTunnel};
    use base64::Engine;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        tunnel: Arc<FakeTunnel>,
        sessions: Arc<SessionRegistry>,
        store: Arc<DeploymentStore>,
        orchestrator: DeploymentOrchestrator,
        root: PathBuf,
    }

    fn harness() -> Harness {
        harness_with_store(DeploymentStore::new())
    }

    fn harness_with_store(store: DeploymentStore) -> Harness {
        let root = scratch_dir("orchestrator");
        let runtime = FakeRuntime::new();
        let tunnel = FakeTunnel::new();
        let sessions = Arc::new(SessionRegistry::new());
        let store = Arc::new(store);
        let orchestrator = DeploymentOrchestrator::new(
            runtime.clone(),
            tunnel.clone(),
            sessions.clone(),
            store.clone(),
            &test_config(&root),
        );
        Harness {
            runtime,
            tunnel,
            sessions,
            store,
            orchestrator,
            root,
        }
    }

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text)
    }

    fn node_request(name: &str) -> DeployRequest {
        DeployRequest {
            name: name.to_string(),
            language: "nodejs".to_string(),
            files: vec![SourceFile {
                path: "server.js".to_string(),
                content: encode(
                    "const port = process.env.PORT || 3000;\nrequire('http').createServer().listen(port);\n",
                ),
            }],
            run_command: None,
            session_id: None,
            env: BTreeMap::new(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn build_root_is_empty(root: &Path) -> bool {
        std::fs::read_dir(root).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[tokio::test]
    async fn test_deploy_node_app() {
        let h = harness();
        let response = h.orchestrator.deploy(node_request("demo1")).await.unwrap();

        assert_eq!(response.url, "https://deployify-demo1.ngrok.app");
        assert_eq!(response.internal_port, 3000);
        assert!((30000..30100).contains(&response.exposed_port));

        let state = h.runtime.state();
        assert!(state.images.contains("deployify-demo1"));
        assert_eq!(state.pulls, vec!["node:20-alpine".to_string()]);
        let container = &state.containers["deployify-demo1"];
        assert!(container.running);
        assert_eq!(container.host_ports, vec![response.exposed_port]);
        assert!(container
            .env
            .contains(&("PORT".to_string(), "3000".to_string())));
        for file in ["Dockerfile", "deployify-start.sh", "server.js", "tunnel.yml"] {
            assert!(state.last_context_files.iter().any(|f| f == file), "{}", file);
        }
        drop(state);

        assert_eq!(h.tunnel.reserved_count(), 1);
        assert!(build_root_is_empty(&h.root));

        let record = h.store.get(&response.deployment_id).await.unwrap();
        assert_eq!(record.status, DeployStatus::Succeeded);
        assert_eq!(record.phase, DeployPhase::Succeeded);
        assert_eq!(record.url.as_deref(), Some(response.url.as_str()));
        assert_eq!(record.instances, vec!["deployify-demo1".to_string()]);
        assert_eq!(record.stages.len(), 7);
        assert_eq!(h.orchestrator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_completes() {
        let h = harness();
        let mut rx = h.sessions.attach("s-1").await;
        let mut request = node_request("demo1");
        request.session_id = Some("s-1".to_string());

        h.orchestrator.deploy(request).await.unwrap();

        let events = drain(&mut rx);
        let percentages: Vec<u8> = events.iter().map(|e| e.percentage).collect();
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "{:?}", percentages);
        for expected in [5, 15, 25, 35, 75, 90] {
            assert!(percentages.contains(&expected), "missing {}", expected);
        }
        // build output is forwarded at the context percentage
        assert!(events
            .iter()
            .any(|e| e.percentage == 35 && e.message.contains("building")));
        assert!(events.last().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_concurrent_same_name_has_one_winner() {
        let h = harness();
        let request = node_request("demo1");

        let (a, b) = tokio::join!(
            h.orchestrator.deploy(request.clone()),
            h.orchestrator.deploy(request)
        );

        let (ok, err): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
        assert_eq!(ok.len(), 1);
        assert!(matches!(
            err[0].as_ref().unwrap_err(),
            DeployError::Conflict(_)
        ));
        assert_eq!(h.runtime.state().create_calls, 1);
        assert_eq!(h.tunnel.reserved_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_instance_conflicts_without_side_effects() {
        let h = harness();
        h.runtime.seed_container("deployify-demo1", vec![30001]);

        let err = h.orchestrator.deploy(node_request("demo1")).await.unwrap_err();
        assert!(matches!(err, DeployError::Conflict(_)));

        let state = h.runtime.state();
        assert!(state.pulls.is_empty());
        assert_eq!(state.build_attempts, 0);
        assert_eq!(state.create_calls, 0);
        drop(state);
        assert_eq!(h.tunnel.reserved_count(), 0);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejections_touch_nothing() {
        let h = harness();

        let mut request = node_request("demo1");
        request.language = "cobol".to_string();
        let err = h.orchestrator.deploy(request).await.unwrap_err();
        assert!(matches!(err, DeployError::UnsupportedLanguage(_)));

        let err = h
            .orchestrator
            .deploy(node_request("Bad Name!"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));

        assert_eq!(h.tunnel.reserved_count(), 0);
        assert_eq!(h.runtime.state().build_attempts, 0);
    }

    #[tokio::test]
    async fn test_build_retries_then_succeeds() {
        let h = harness();
        h.runtime.state().failing_builds = 2;

        h.orchestrator.deploy(node_request("demo1")).await.unwrap();

        assert_eq!(h.runtime.state().build_attempts, 3);
        assert!(h.runtime.state().containers["deployify-demo1"].running);
    }

    #[tokio::test]
    async fn test_build_failure_rolls_back() {
        let h = harness();
        h.runtime.state().failing_builds = u32::MAX;
        let mut rx = h.sessions.attach("s-1").await;
        let mut request = node_request("demo1");
        request.session_id = Some("s-1".to_string());

        let err = h.orchestrator.deploy(request).await.unwrap_err();
        assert!(matches!(err, DeployError::ImageBuild { attempts: 3, .. }));

        let state = h.runtime.state();
        assert_eq!(state.create_calls, 0);
        assert!(state.removed_images.contains(&"deployify-demo1".to_string()));
        assert!(!state.images.contains("deployify-demo1"));
        drop(state);
        assert_eq!(h.tunnel.reserved_count(), 0);
        assert!(build_root_is_empty(&h.root));

        let events = drain(&mut rx);
        assert!(events.last().unwrap().is_failure());

        let records = h.store.list(10, Some("failed")).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failed_stage, Some(DeployPhase::ImageBuilt));
        assert!(records[0].error.as_deref().unwrap().contains("failed to solve"));

        // the name is free again
        h.runtime.state().failing_builds = 0;
        h.orchestrator.deploy(node_request("demo1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_instance_exit_rolls_back() {
        let h = harness();
        h.runtime
            .state()
            .exit_after_start
            .insert("deployify-demo1".to_string());

        let err = h.orchestrator.deploy(node_request("demo1")).await.unwrap_err();
        assert!(matches!(err, DeployError::InstanceStart(_)));
        assert_eq!(h.runtime.resource_counts().1, 0);
        assert_eq!(h.tunnel.reserved_count(), 0);
        assert!(!h.runtime.state().images.contains("deployify-demo1"));
    }

    #[tokio::test]
    async fn test_start_failure_removes_created_instance() {
        let h = harness();
        h.runtime
            .state()
            .fail_start_for
            .insert("deployify-demo1".to_string());

        let err = h.orchestrator.deploy(node_request("demo1")).await.unwrap_err();
        assert!(matches!(err, DeployError::InstanceStart(_)));
        assert!(h
            .runtime
            .state()
            .removed_containers
            .contains(&"deployify-demo1".to_string()));
        assert_eq!(h.tunnel.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_failure_is_upstream() {
        let h = harness();
        h.tunnel.state().fail_reserve_domain = true;

        let err = h.orchestrator.deploy(node_request("demo1")).await.unwrap_err();
        assert!(matches!(err, DeployError::UpstreamProvisioning(_)));
        assert_eq!(h.runtime.state().build_attempts, 0);
        assert!(build_root_is_empty(&h.root));
    }

    #[tokio::test]
    async fn test_rollback_errors_do_not_mask_cause() {
        let h = harness();
        h.runtime.state().failing_builds = u32::MAX;
        h.tunnel.state().fail_release = true;

        let err = h.orchestrator.deploy(node_request("demo1")).await.unwrap_err();
        assert!(matches!(err, DeployError::ImageBuild { .. }));
    }

    fn data_request(name: &str) -> DataServiceRequest {
        DataServiceRequest {
            name: name.to_string(),
            engine: "postgres".to_string(),
            session_id: Some("s-db".to_string()),
        }
    }

    #[tokio::test]
    async fn test_data_service_pair() {
        let h = harness();
        let mut rx = h.sessions.attach("s-db").await;

        let response = h
            .orchestrator
            .deploy_data_service(data_request("pg1"))
            .await
            .unwrap();

        assert!(response.connection_url.starts_with("postgres://deployify:"));
        assert!(response.connection_url.contains("@1.tcp.ngrok.io:"));
        assert_eq!(response.admin_url, "https://deployify-pg1-admin.ngrok.app");
        assert_ne!(response.data_port, response.admin_port);

        let state = h.runtime.state();
        let admin = &state.containers["deployify-pg1-admin"];
        assert_eq!(
            admin.extra_hosts,
            vec!["host.docker.internal:host-gateway".to_string()]
        );
        assert!(admin.env.contains(&(
            "ADMINER_DEFAULT_SERVER".to_string(),
            format!("host.docker.internal:{}", response.data_port)
        )));
        assert!(state.containers["deployify-pg1-db"].running);
        drop(state);
        assert_eq!(h.tunnel.reserved_count(), 2);

        let percentages: Vec<u8> = drain(&mut rx).iter().map(|e| e.percentage).collect();
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]), "{:?}", percentages);
        assert!(percentages.iter().any(|p| *p > 50 && *p < 100));
        assert_eq!(percentages.last(), Some(&100));

        let record = h.store.get(&response.deployment_id).await.unwrap();
        assert_eq!(record.kind, DeploymentKind::DataService);
        assert_eq!(record.stages.len(), 14);
    }

    #[tokio::test]
    async fn test_data_service_rolls_back_first_instance() {
        let h = harness();
        h.tunnel.state().fail_reserve_domain = true;

        let err = h
            .orchestrator
            .deploy_data_service(data_request("pg1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::UpstreamProvisioning(_)));

        let state = h.runtime.state();
        assert!(state
            .removed_containers
            .contains(&"deployify-pg1-db".to_string()));
        assert!(state.containers.is_empty());
        drop(state);
        assert_eq!(h.tunnel.reserved_count(), 0);
        assert_eq!(h.tunnel.state().released, vec!["ra_1".to_string()]);

        let record = &h.store.list(1, None).await[0];
        assert_eq!(record.failed_stage, Some(DeployPhase::EndpointReserved));
        assert!(record
            .stages
            .iter()
            .any(|s| s.display_name == "Reserve Endpoint (admin)"));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let h = harness();
        let response = h.orchestrator.deploy(node_request("demo1")).await.unwrap();

        let report = h.orchestrator.teardown("demo1").await.unwrap();
        assert_eq!(report.instances, vec!["deployify-demo1".to_string()]);
        assert_eq!(report.endpoints_released, 1);
        assert_eq!(h.runtime.resource_counts().1, 0);
        assert!(!h.runtime.state().images.contains("deployify-demo1"));
        assert_eq!(h.tunnel.reserved_count(), 0);
        assert_eq!(
            h.store.get(&response.deployment_id).await.unwrap().status,
            DeployStatus::Removed
        );

        let again = h.orchestrator.teardown("demo1").await.unwrap();
        assert!(again.instances.is_empty());
        assert_eq!(again.endpoints_released, 0);
    }

    #[tokio::test]
    async fn test_teardown_removes_untracked_instances() {
        let h = harness();
        h.runtime.seed_labeled_container(
            "deployify-old-db",
            vec![30005],
            &[
                ("deployify.endpoint.kind", "tcp"),
                ("deployify.endpoint.id", "ra_9"),
                ("deployify.endpoint.target", "1.tcp.ngrok.io:20009"),
            ],
        );

        let report = h.orchestrator.teardown("old").await.unwrap();
        assert_eq!(report.instances, vec!["deployify-old-db".to_string()]);
        assert_eq!(report.endpoints_released, 1);
        assert_eq!(h.tunnel.state().released, vec!["ra_9".to_string()]);
        assert!(h.runtime.state().containers.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_after_history_eviction_releases_endpoint() {
        let h = harness_with_store(DeploymentStore::with_capacity(1));
        h.orchestrator.deploy(node_request("a")).await.unwrap();
        h.orchestrator.deploy(node_request("b")).await.unwrap();
        assert!(h.store.latest_live("a").await.is_none());
        assert_eq!(h.tunnel.reserved_count(), 2);

        let reservation = {
            let state = h.runtime.state();
            state.containers["deployify-a"].labels["deployify.endpoint.id"].clone()
        };
        let report = h.orchestrator.teardown("a").await.unwrap();

        assert_eq!(report.instances, vec!["deployify-a".to_string()]);
        assert_eq!(report.endpoints_released, 1);
        assert_eq!(h.tunnel.reserved_count(), 1);
        assert_eq!(h.tunnel.state().released, vec![reservation]);
        assert!(h.runtime.state().containers.contains_key("deployify-b"));
    }

    #[tokio::test]
    async fn test_teardown_refuses_instance_without_endpoint_labels() {
        let h = harness();
        h.runtime.seed_container("deployify-old", vec![30005]);

        let err = h.orchestrator.teardown("old").await.unwrap_err();
        assert!(matches!(err, DeployError::UpstreamProvisioning(_)));
        assert!(h.runtime.state().containers.contains_key("deployify-old"));
        assert_eq!(h.runtime.state().stop_calls, 0);
        assert_eq!(h.orchestrator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_crash_looping_instance_rolls_back() {
        let h = harness();
        h.runtime
            .state()
            .restart_loop_for
            .insert("deployify-demo1".to_string());

        let err = h.orchestrator.deploy(node_request("demo1")).await.unwrap_err();
        assert!(
            matches!(&err, DeployError::InstanceStart(msg) if msg.contains("restarting")),
            "{:?}",
            err
        );
        assert_eq!(h.runtime.resource_counts().1, 0);
        assert_eq!(h.tunnel.reserved_count(), 0);
    }
}
