//! Run orchestration: drives a triggered run through every stage.

use chrono::Utc;
use rollout_config::{PipelineConfig, VariableContext};
use rollout_core::artifact::{ArtifactBuilder, ArtifactRef, ArtifactRegistry, BuildContext};
use rollout_core::clock::Clock;
use rollout_core::deployer::{ComputePlatform, RollbackResult};
use rollout_core::gate::GateCheck;
use rollout_core::infra::{DesiredState, Provisioner};
use rollout_core::pipeline::{
    FailureKind, Run, RunStatus, Stage, StageOutput, StageResult, StageStatus, Trigger,
};
use rollout_core::store::{DeploymentStateStore, RunStore};
use rollout_core::{Error, Result, RunId};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::deploy::ServiceDeployer;
use crate::gate::GateRunner;
use crate::publish::{PublishOutcome, RegistryPublisher};
use crate::rollback::RollbackController;
use crate::verify::HealthVerifier;

const EVENT_CAPACITY: usize = 256;

/// Events emitted while runs progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted { run_id: RunId, service: String },
    StageStarted { run_id: RunId, stage: Stage },
    StageCompleted { run_id: RunId, stage: Stage, status: StageStatus },
    RunCompleted { run_id: RunId, status: RunStatus },
}

/// External systems a service's pipeline talks to.
pub struct Backends {
    pub checks: Vec<Arc<dyn GateCheck>>,
    pub builder: Arc<dyn ArtifactBuilder>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub provisioner: Arc<dyn Provisioner>,
    pub platform: Arc<dyn ComputePlatform>,
}

/// Everything needed to run the pipeline of one service.
pub struct ServicePipeline {
    config: PipelineConfig,
    gates: GateRunner,
    builder: Arc<dyn ArtifactBuilder>,
    publisher: RegistryPublisher,
    provisioner: Arc<dyn Provisioner>,
    deployer: Arc<ServiceDeployer>,
    verifier: Arc<HealthVerifier>,
    rollback: RollbackController,
}

impl ServicePipeline {
    pub fn new(
        config: PipelineConfig,
        backends: Backends,
        state: Arc<dyn DeploymentStateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gates = GateRunner::new(backends.checks, config.gates.policy.clone());
        let publisher = RegistryPublisher::new(backends.registry, config.registry.retry, clock.clone());
        let verifier = Arc::new(HealthVerifier::new(
            backends.platform.clone(),
            config.verify,
            clock.clone(),
        ));
        let deployer = Arc::new(ServiceDeployer::new(
            backends.platform,
            state.clone(),
            verifier.clone(),
            clock.clone(),
            config.deploy.ready_timeout,
        ));
        let rollback = RollbackController::new(
            state,
            deployer.clone(),
            verifier.clone(),
            clock,
            config.verify.timeout,
        );

        Self {
            config,
            gates,
            builder: backends.builder,
            publisher,
            provisioner: backends.provisioner,
            deployer,
            verifier,
            rollback,
        }
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gates(&self) -> &GateRunner {
        &self.gates
    }

    fn build_context(&self, vars: &VariableContext) -> BuildContext {
        let build = &self.config.build;
        BuildContext {
            revision: vars.revision.clone(),
            service: self.config.service.clone(),
            context_dir: self.config.source_dir.join(vars.interpolate(&build.context)),
            dockerfile: vars.interpolate(&build.dockerfile),
            tag: vars.interpolate(&build.tag),
            build_args: vars.interpolate_map(&build.args),
        }
    }

    fn desired_state(&self, vars: &VariableContext) -> DesiredState {
        let mut desired = self.config.infrastructure.desired.clone();
        desired.variables = vars.interpolate_map(&desired.variables);
        desired
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: watch::Sender<bool>,
}

struct Inner {
    pipelines: HashMap<String, Arc<ServicePipeline>>,
    runs: Arc<dyn RunStore>,
    active: Mutex<HashMap<String, ActiveRun>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Inner {
    /// Reserve the service's single active-run slot.
    fn claim(self: &Arc<Self>, service: &str, run_id: RunId) -> Result<(Slot, watch::Sender<bool>)> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(service) {
            return Err(Error::RunInProgress(service.to_string()));
        }

        let (cancel, _) = watch::channel(false);
        active.insert(
            service.to_string(),
            ActiveRun {
                run_id,
                cancel: cancel.clone(),
            },
        );

        let slot = Slot {
            inner: Arc::clone(self),
            service: service.to_string(),
            run_id,
        };
        Ok((slot, cancel))
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Releases a service's active-run slot when dropped.
struct Slot {
    inner: Arc<Inner>,
    service: String,
    run_id: RunId,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        if active
            .get(&self.service)
            .is_some_and(|a| a.run_id == self.run_id)
        {
            active.remove(&self.service);
        }
    }
}

/// Handle to a run executing in the background.
pub struct RunHandle {
    run_id: RunId,
    service: String,
    cancel: watch::Sender<bool>,
    join: JoinHandle<Run>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the run to reach a terminal status.
    pub async fn join(self) -> Result<Run> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("run {} task failed: {e}", self.run_id)))
    }
}

/// Orchestrates pipeline runs for a set of services.
///
/// At most one run is active per service. Cloning is cheap and clones share
/// the same runs.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(pipelines: impl IntoIterator<Item = ServicePipeline>, runs: Arc<dyn RunStore>) -> Self {
        let pipelines = pipelines
            .into_iter()
            .map(|p| (p.service().to_string(), Arc::new(p)))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                pipelines,
                runs,
                active: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Services with a configured pipeline, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut services: Vec<&str> = self.inner.pipelines.keys().map(String::as_str).collect();
        services.sort_unstable();
        services
    }

    pub fn pipeline(&self, service: &str) -> Option<&ServicePipeline> {
        self.inner.pipelines.get(service).map(Arc::as_ref)
    }

    pub fn run_store(&self) -> Arc<dyn RunStore> {
        self.inner.runs.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Run currently holding the service's slot, if any.
    pub fn active_run(&self, service: &str) -> Option<RunId> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .map(|a| a.run_id)
    }

    /// Start a run in the background.
    ///
    /// Fails with `RunInProgress` when the service already has an active run.
    pub async fn start(&self, trigger: Trigger) -> Result<RunHandle> {
        trigger.validate()?;
        let pipeline = self
            .inner
            .pipelines
            .get(&trigger.target_service)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("no pipeline for service {}", trigger.target_service))
            })?;

        let run = Run::new(trigger);
        let run_id = run.id;
        let service = run.service().to_string();
        let (slot, cancel) = self.inner.claim(&service, run_id)?;

        if let Err(e) = self.inner.runs.create(&run).await {
            warn!(run_id = %run_id, error = %e, "Failed to persist new run");
        }

        let driver = RunDriver {
            inner: self.inner.clone(),
            pipeline,
            cancel: cancel.subscribe(),
            run,
        };
        let join = tokio::spawn(async move {
            let _slot = slot;
            driver.drive().await
        });

        Ok(RunHandle {
            run_id,
            service,
            cancel,
            join,
        })
    }

    /// Run to completion.
    pub async fn execute(&self, trigger: Trigger) -> Result<Run> {
        self.start(trigger).await?.join().await
    }

    /// Request cancellation of an active run.
    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        let run = active
            .values()
            .find(|a| a.run_id == run_id)
            .ok_or_else(|| Error::NotFound(format!("no active run {run_id}")))?;
        run.cancel.send_replace(true);
        info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    /// Roll a service back to its last known-good artifact outside of a run.
    pub async fn rollback(&self, service: &str) -> Result<RollbackResult> {
        let pipeline = self
            .inner
            .pipelines
            .get(service)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no pipeline for service {service}")))?;
        let (_slot, _cancel) = self.inner.claim(service, RunId::new())?;
        pipeline.rollback.rollback(service).await
    }
}

/// Drives one run. Owns the run record until it is terminal.
struct RunDriver {
    inner: Arc<Inner>,
    pipeline: Arc<ServicePipeline>,
    cancel: watch::Receiver<bool>,
    run: Run,
}

impl RunDriver {
    async fn drive(mut self) -> Run {
        let status = match self.execute().await {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %self.run.id, error = %e, "Run aborted");
                RunStatus::Failed
            }
        };
        self.complete(status).await;
        self.run
    }

    async fn execute(&mut self) -> Result<RunStatus> {
        self.run.start()?;
        let started_at = self.run.started_at.unwrap_or_else(Utc::now);
        if let Err(e) = self
            .inner
            .runs
            .set_status(self.run.id, RunStatus::Running, started_at)
            .await
        {
            warn!(run_id = %self.run.id, error = %e, "Failed to persist run status");
        }

        let pipeline = Arc::clone(&self.pipeline);
        let service = self.run.service().to_string();
        let revision = self.run.trigger.revision_id.clone();
        let mut vars = VariableContext::for_run(&self.run.trigger, self.run.id);
        vars.populate_env();

        info!(run_id = %self.run.id, service = %service, revision = %revision, "Run started");
        self.inner.emit(PipelineEvent::RunStarted {
            run_id: self.run.id,
            service: service.clone(),
        });

        // Gate
        self.enter(Stage::Gate)?;
        let started_at = Utc::now();
        let gate = match self
            .call(Stage::Gate, async { Ok(pipeline.gates.run_gates(&revision).await) })
            .await
        {
            Ok(result) => result,
            Err(e) => failure(Stage::Gate, &e, StageOutput::None, started_at),
        };
        if !gate.is_passed() {
            return self.halt(gate).await;
        }
        self.record(gate).await?;

        // Build
        if self.cancel_requested() {
            return Ok(RunStatus::Cancelled);
        }
        self.enter(Stage::Build)?;
        let started_at = Utc::now();
        let context = pipeline.build_context(&vars);
        let built = match self.call(Stage::Build, pipeline.builder.build(&context)).await {
            Ok(artifact) => artifact,
            Err(e) => return self.halt(failure(Stage::Build, &e, StageOutput::None, started_at)).await,
        };
        self.record(StageResult::passed(
            Stage::Build,
            StageOutput::Built {
                artifact: built.clone(),
            },
            started_at,
        ))
        .await?;

        // Publish
        if self.cancel_requested() {
            return Ok(RunStatus::Cancelled);
        }
        self.enter(Stage::Publish)?;
        let started_at = Utc::now();
        let published = match self
            .call(Stage::Publish, async { Ok(pipeline.publisher.publish(&built).await) })
            .await
        {
            Ok(PublishOutcome {
                result: Ok(artifact),
                attempts,
            }) => {
                self.record(
                    StageResult::passed(
                        Stage::Publish,
                        StageOutput::Published {
                            artifact: artifact.clone(),
                        },
                        started_at,
                    )
                    .with_attempts(attempts),
                )
                .await?;
                artifact
            }
            Ok(PublishOutcome {
                result: Err(e),
                attempts,
            }) => {
                let result = failure(Stage::Publish, &e, StageOutput::None, started_at);
                return self.halt(result.with_attempts(attempts)).await;
            }
            Err(e) => {
                return self
                    .halt(failure(Stage::Publish, &e, StageOutput::None, started_at))
                    .await;
            }
        };

        // Provision
        if self.cancel_requested() {
            return Ok(RunStatus::Cancelled);
        }
        self.enter(Stage::Provision)?;
        let started_at = Utc::now();
        let desired = pipeline.desired_state(&vars);
        match self
            .call(Stage::Provision, pipeline.provisioner.reconcile(&desired))
            .await
        {
            Ok(result) if result.is_success() => {
                self.record(StageResult::passed(
                    Stage::Provision,
                    StageOutput::Reconciled { result },
                    started_at,
                ))
                .await?;
            }
            Ok(result) => {
                let reason = result.failure_summary();
                return self
                    .halt(StageResult::failed(
                        Stage::Provision,
                        FailureKind::Provision,
                        reason,
                        StageOutput::Reconciled { result },
                        started_at,
                    ))
                    .await;
            }
            Err(e) => {
                return self
                    .halt(failure(Stage::Provision, &e, StageOutput::None, started_at))
                    .await;
            }
        }

        // Deploy. From here on a cancel turns into a rollback.
        if self.cancel_requested() {
            return Ok(RunStatus::Cancelled);
        }
        self.enter(Stage::Deploy)?;
        let started_at = Utc::now();
        let deployed = match self
            .call(Stage::Deploy, pipeline.deployer.deploy(&service, &published))
            .await
        {
            Ok(result) => {
                self.record(StageResult::passed(
                    Stage::Deploy,
                    StageOutput::Deployed { result },
                    started_at,
                ))
                .await?;
                true
            }
            // The update was accepted, so the new artifact is live but unhealthy.
            Err(e @ (Error::NotReady(_) | Error::Timeout(_))) => {
                self.record(StageResult::failed(
                    Stage::Deploy,
                    FailureKind::Verify,
                    e.to_string(),
                    StageOutput::None,
                    started_at,
                ))
                .await?;
                false
            }
            Err(e) => {
                return self
                    .halt(failure(Stage::Deploy, &e, StageOutput::None, started_at))
                    .await;
            }
        };

        if deployed && self.verify(&pipeline, &service, &published).await? {
            return Ok(RunStatus::Succeeded);
        }

        // Rollback
        self.enter(Stage::Rollback)?;
        let started_at = Utc::now();
        match self
            .call(Stage::Rollback, pipeline.rollback.rollback(&service))
            .await
        {
            Ok(result) => {
                self.record(StageResult::passed(
                    Stage::Rollback,
                    StageOutput::RolledBack { result },
                    started_at,
                ))
                .await?;
                Ok(RunStatus::RolledBack)
            }
            Err(e) => {
                error!(run_id = %self.run.id, service = %service, "Rollback failed, operator needed");
                self.record(failure(Stage::Rollback, &e, StageOutput::None, started_at))
                    .await?;
                Ok(RunStatus::Failed)
            }
        }
    }

    /// Verify the deployed artifact and commit it as known-good. Returns
    /// whether the run succeeded; anything else needs a rollback.
    async fn verify(
        &mut self,
        pipeline: &ServicePipeline,
        service: &str,
        published: &ArtifactRef,
    ) -> Result<bool> {
        self.enter(Stage::Verify)?;
        if self.cancel_requested() {
            self.record(StageResult::skipped(Stage::Verify, "cancelled"))
                .await?;
            return Ok(false);
        }

        let started_at = Utc::now();
        let timeout = pipeline.config.verify.timeout;
        let result = match self
            .call(Stage::Verify, async {
                Ok(pipeline.verifier.await_stable(service, timeout).await)
            })
            .await
        {
            Ok(result) => result,
            Err(Error::Cancelled) => {
                self.record(StageResult::skipped(Stage::Verify, "cancelled"))
                    .await?;
                return Ok(false);
            }
            Err(e) => {
                self.record(failure(Stage::Verify, &e, StageOutput::None, started_at))
                    .await?;
                return Ok(false);
            }
        };

        if !result.is_stable() {
            let reason = result.describe();
            self.record(StageResult::failed(
                Stage::Verify,
                FailureKind::Verify,
                reason,
                StageOutput::Verified { result },
                started_at,
            ))
            .await?;
            return Ok(false);
        }

        // A run only succeeds once the known-good pointer names its artifact.
        if let Err(e) = pipeline
            .deployer
            .commit(service, published, Some(self.run.id))
            .await
        {
            error!(
                run_id = %self.run.id,
                service = %service,
                error = %e,
                "Failed to record known-good artifact"
            );
            self.record(StageResult::failed(
                Stage::Verify,
                FailureKind::Verify,
                format!("known-good commit failed: {e}"),
                StageOutput::Verified { result },
                started_at,
            ))
            .await?;
            return Ok(false);
        }

        self.record(StageResult::passed(
            Stage::Verify,
            StageOutput::Verified { result },
            started_at,
        ))
        .await?;
        Ok(true)
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run a stage's work under its timeout. Gate, build and verify also
    /// stop early when the run is cancelled.
    async fn call<T>(&self, stage: Stage, work: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.pipeline.config.timeouts.for_stage(stage);
        let bounded = async move {
            match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("{stage} stage exceeded {limit:?}"))),
            }
        };

        if !(stage.is_abortable() || stage == Stage::Verify) {
            return bounded.await;
        }

        let mut cancel = self.cancel.clone();
        tokio::select! {
            result = bounded => result,
            () = cancelled(&mut cancel) => Err(Error::Cancelled),
        }
    }

    fn enter(&mut self, stage: Stage) -> Result<()> {
        self.run.enter(stage)?;
        info!(run_id = %self.run.id, stage = %stage, "Stage started");
        self.inner.emit(PipelineEvent::StageStarted {
            run_id: self.run.id,
            stage,
        });
        Ok(())
    }

    async fn record(&mut self, result: StageResult) -> Result<()> {
        let stage = result.stage;
        let status = result.status;
        match &result.failure {
            Some(failure) if status == StageStatus::Failed => warn!(
                run_id = %self.run.id,
                stage = %stage,
                kind = %failure.kind,
                reason = %failure.reason,
                "Stage failed"
            ),
            _ => info!(run_id = %self.run.id, stage = %stage, status = %status, "Stage finished"),
        }

        self.run.record(result.clone())?;
        if let Err(e) = self.inner.runs.append(self.run.id, &result).await {
            warn!(run_id = %self.run.id, stage = %stage, error = %e, "Failed to persist stage result");
        }
        self.inner.emit(PipelineEvent::StageCompleted {
            run_id: self.run.id,
            stage,
            status,
        });
        Ok(())
    }

    /// Record a failed stage and stop the run.
    async fn halt(&mut self, result: StageResult) -> Result<RunStatus> {
        let status = match result.failure.as_ref().map(|f| f.kind) {
            Some(FailureKind::Cancelled) => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        self.record(result).await?;
        Ok(status)
    }

    async fn complete(&mut self, status: RunStatus) {
        if let Err(e) = self.run.finish(status) {
            error!(run_id = %self.run.id, error = %e, "Cannot finish run");
        }
        let finished_at = self.run.finished_at.unwrap_or_else(Utc::now);
        if let Err(e) = self
            .inner
            .runs
            .set_status(self.run.id, self.run.status, finished_at)
            .await
        {
            warn!(run_id = %self.run.id, error = %e, "Failed to persist run status");
        }

        info!(
            run_id = %self.run.id,
            service = %self.run.service(),
            status = %self.run.status,
            "Run finished"
        );
        self.inner.emit(PipelineEvent::RunCompleted {
            run_id: self.run.id,
            status: self.run.status,
        });
    }
}

fn failure(stage: Stage, error: &Error, output: StageOutput, started_at: chrono::DateTime<Utc>) -> StageResult {
    match error {
        Error::Cancelled => {
            StageResult::failed(stage, FailureKind::Cancelled, "cancelled", output, started_at)
        }
        e => StageResult::failed(stage, FailureKind::for_stage(stage), e.to_string(), output, started_at),
    }
}

/// Resolves once cancellation is requested. Never resolves if every
/// sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
