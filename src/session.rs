//! Execution session: the context every component runs against.
//!
//! A session binds device and sensor drivers, device profiles, sensor specs
//! and configuration for one recipe run. It owns the command translator,
//! the safety monitor and the interlock. Once the interlock trips (external
//! abort or safety veto) every device is stopped and the session is done;
//! resuming takes a new session.

use crate::config::EngineConfig;
use crate::driver::{Clock, DeviceDriver, SensorDriver};
use crate::error::EngineError;
use crate::progress::{ProgressPublisher, ProgressStream};
use crate::recipe::{Dependency, DeviceProfile, Recipe, SensorSpec, Step};
use crate::safety::{
    Observation, SafetyAssessment, SafetyEventRecord, SafetyInterlock, SafetyLevel, SafetyLimits,
    SafetyMonitor,
};
use crate::scheduler::{self, StepExecutionState, StepState};
use crate::translator::CommandTranslator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Outcome of stopping every device in the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub acknowledged: Vec<String>,
    /// No stop acknowledgment within the grace timeout.
    pub unresponsive: Vec<String>,
}

pub(crate) struct SessionInner {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Clock,
    pub(crate) devices: Arc<dyn DeviceDriver>,
    pub(crate) sensors: Arc<dyn SensorDriver>,
    pub(crate) profiles: BTreeMap<String, DeviceProfile>,
    pub(crate) sensor_specs: Vec<SensorSpec>,
    pub(crate) inventory: Option<BTreeSet<String>>,
    pub(crate) translator: CommandTranslator,
    pub(crate) interlock: SafetyInterlock,
    pub(crate) progress: ProgressPublisher,
    safety: Mutex<SafetyMonitor>,
    states: Mutex<BTreeMap<String, StepExecutionState>>,
    confirmations: Mutex<BTreeSet<String>>,
    teardown: OnceCell<StopReport>,
}

impl SessionInner {
    pub(crate) fn record(&self, exec: &StepExecutionState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(exec.step_id.clone(), exec.clone());
    }

    pub(crate) fn state_of(&self, step_id: &str) -> Option<StepState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(step_id).map(|s| s.state)
    }

    pub(crate) fn is_confirmed(&self, step_id: &str) -> bool {
        let confirmations = self.confirmations.lock().unwrap_or_else(|e| e.into_inner());
        confirmations.contains(step_id)
    }

    pub(crate) fn assess_safety(
        &self,
        now_ms: u64,
        device: &str,
        limits: &SafetyLimits,
        observations: &[Observation<'_>],
        status: Option<&crate::driver::DeviceStatus>,
        runtime_ms: u64,
    ) -> SafetyAssessment {
        let mut monitor = self.safety.lock().unwrap_or_else(|e| e.into_inner());
        monitor.assess(now_ms, device, limits, observations, status, runtime_ms)
    }

    /// Trips the interlock and stops every device.
    pub(crate) async fn emergency_stop(&self, reason: EngineError) -> StopReport {
        if self.interlock.trip(reason.clone()) {
            error!(reason = %reason, "emergency stop");
        }
        self.teardown().await
    }

    /// Single teardown path shared by abort and the safety monitor.
    async fn teardown(&self) -> StopReport {
        self.teardown.get_or_init(|| self.stop_all()).await.clone()
    }

    async fn stop_all(&self) -> StopReport {
        let grace = Duration::from_millis(self.config.devices.stop_grace_ms);
        let mut stops = JoinSet::new();
        for device in self.profiles.keys() {
            let driver = Arc::clone(&self.devices);
            let device = device.clone();
            stops.spawn(async move {
                let acked = matches!(
                    tokio::time::timeout(grace, driver.stop(&device)).await,
                    Ok(Ok(_))
                );
                (device, acked)
            });
        }

        let mut report = StopReport::default();
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((device, true)) => {
                    info!(device = %device, "stop acknowledged");
                    report.acknowledged.push(device);
                }
                Ok((device, false)) => {
                    error!(device = %device, grace_ms = grace.as_millis() as u64, "device unresponsive to stop");
                    report.unresponsive.push(device);
                }
                Err(e) => error!(error = %e, "stop task failed"),
            }
        }
        report.acknowledged.sort();
        report.unresponsive.sort();
        report
    }

    /// Stops one device after a step failed while driving it.
    pub(crate) async fn stop_device(&self, device: &str) -> bool {
        let grace = Duration::from_millis(self.config.devices.stop_grace_ms);
        match tokio::time::timeout(grace, self.devices.stop(device)).await {
            Ok(Ok(_)) => {
                info!(device, "stop acknowledged");
                true
            }
            Ok(Err(e)) => {
                error!(device, error = %e, "stop failed");
                false
            }
            Err(_) => {
                error!(device, "device unresponsive to stop");
                false
            }
        }
    }
}

pub struct SessionBuilder {
    config: EngineConfig,
    devices: Arc<dyn DeviceDriver>,
    sensors: Arc<dyn SensorDriver>,
    profiles: BTreeMap<String, DeviceProfile>,
    sensor_specs: Vec<SensorSpec>,
    inventory: Option<BTreeSet<String>>,
}

impl SessionBuilder {
    pub fn profiles(mut self, profiles: impl IntoIterator<Item = DeviceProfile>) -> Self {
        self.profiles
            .extend(profiles.into_iter().map(|p| (p.id.clone(), p)));
        self
    }

    pub fn sensors(mut self, specs: impl IntoIterator<Item = SensorSpec>) -> Self {
        self.sensor_specs.extend(specs);
        self
    }

    /// Ingredient ids on hand. Without an inventory, ingredients are assumed.
    pub fn inventory<S: Into<String>>(mut self, ingredients: impl IntoIterator<Item = S>) -> Self {
        self.inventory = Some(ingredients.into_iter().map(Into::into).collect());
        self
    }

    pub fn recipe(self, recipe: &Recipe) -> Self {
        self.profiles(recipe.device_profiles.iter().cloned())
            .sensors(recipe.sensors.iter().cloned())
    }

    pub fn build(self) -> Result<ExecutionSession, EngineError> {
        self.config.validate()?;
        Ok(ExecutionSession {
            inner: Arc::new(SessionInner {
                config: self.config,
                clock: Clock::new(),
                devices: self.devices,
                sensors: self.sensors,
                profiles: self.profiles,
                sensor_specs: self.sensor_specs,
                inventory: self.inventory,
                translator: CommandTranslator::new(),
                interlock: SafetyInterlock::new(),
                progress: ProgressPublisher::new(),
                safety: Mutex::new(SafetyMonitor::new()),
                states: Mutex::new(BTreeMap::new()),
                confirmations: Mutex::new(BTreeSet::new()),
                teardown: OnceCell::new(),
            }),
        })
    }
}

/// One run of a recipe.
pub struct ExecutionSession {
    inner: Arc<SessionInner>,
}

impl ExecutionSession {
    pub fn builder(
        config: EngineConfig,
        devices: Arc<dyn DeviceDriver>,
        sensors: Arc<dyn SensorDriver>,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            devices,
            sensors,
            profiles: BTreeMap::new(),
            sensor_specs: Vec::new(),
            inventory: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Runs one step to a terminal state.
    pub async fn run_step(&self, step: &Step) -> StepExecutionState {
        scheduler::run_step(&self.inner, step).await
    }

    /// Runs a whole recipe.
    ///
    /// Steps wait for every earlier step unless marked `independent`, and
    /// always wait for the steps named in `s-…:result` references. A
    /// reference to the step itself or to a later step fails with
    /// `DependencyFailed` instead of waiting. Results come back in input order. A safety veto surfaces as the one
    /// `CriticalCondition` error; every step is then `Aborted`.
    pub async fn run_recipe(&self, steps: &[Step]) -> Result<Vec<StepExecutionState>, EngineError> {
        let channels: Vec<_> = steps
            .iter()
            .map(|_| watch::channel::<Option<StepState>>(None))
            .collect();
        let index: BTreeMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let continue_after_failure = self.inner.config.monitoring.continue_after_failure;

        let mut tasks = JoinSet::new();
        for (i, (step, (tx, _))) in steps.iter().zip(channels.iter()).enumerate() {
            let earlier: Vec<(String, watch::Receiver<Option<StepState>>)> = if step.independent {
                Vec::new()
            } else {
                (0..i)
                    .map(|j| (steps[j].id.clone(), channels[j].1.clone()))
                    .collect()
            };
            let referenced: Vec<(String, usize)> = step
                .dependencies()
                .filter_map(|d| match d {
                    Dependency::StepResult(id) => {
                        let j = index.get(id.as_str()).copied()?;
                        Some((id, j))
                    }
                    Dependency::Ingredient(_) => None,
                })
                .collect();
            // only backward edges are awaited, so the wait graph has no cycles
            let forward = referenced
                .iter()
                .find(|(_, j)| *j >= i)
                .map(|(id, _)| id.clone());
            if let Some(id) = &forward {
                warn!(step = %step.id, dependency = %id, "result referenced before it can exist");
            }
            let explicit: Vec<watch::Receiver<Option<StepState>>> = referenced
                .iter()
                .filter(|(_, j)| *j < i)
                .map(|(_, j)| channels[*j].1.clone())
                .collect();

            let inner = Arc::clone(&self.inner);
            let step = step.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let mut blocker = None;
                for (id, mut rx) in earlier {
                    let state = wait_terminal(&mut rx).await;
                    if state != Some(StepState::Completed) && blocker.is_none() {
                        blocker = Some(id);
                    }
                }
                for mut rx in explicit {
                    wait_terminal(&mut rx).await;
                }

                let exec = match (forward, blocker) {
                    (Some(dependency), _) => {
                        let error = EngineError::DependencyFailed {
                            step: step.id.clone(),
                            dependency,
                        };
                        scheduler::skip_step(&inner, &step, error).await
                    }
                    (None, Some(dependency)) if !continue_after_failure => {
                        let error = EngineError::DependencyFailed {
                            step: step.id.clone(),
                            dependency,
                        };
                        scheduler::skip_step(&inner, &step, error).await
                    }
                    _ => scheduler::run_step(&inner, &step).await,
                };
                tx.send_replace(Some(exec.state));
                (i, exec)
            });
        }

        let mut results: Vec<Option<StepExecutionState>> = vec![None; steps.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, exec)) => results[i] = Some(exec),
                Err(e) => error!(error = %e, "step task failed"),
            }
        }

        if let Some(reason) = self.inner.interlock.reason() {
            if reason.is_critical() {
                return Err(reason);
            }
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// External cancellation; shares the teardown path with the safety monitor.
    pub async fn abort(&self, reason: &str) -> StopReport {
        if self.inner.interlock.trip(EngineError::Aborted(reason.to_string())) {
            warn!(reason, "session abort requested");
        }
        self.inner.teardown().await
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.interlock.is_tripped()
    }

    /// Why the session stopped, if it did.
    pub fn stop_reason(&self) -> Option<EngineError> {
        self.inner.interlock.reason()
    }

    /// Sets `human_confirmed` for a step.
    pub fn confirm(&self, step_id: &str) {
        let mut confirmations = self
            .inner
            .confirmations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        confirmations.insert(step_id.to_string());
        info!(step = step_id, "operator confirmed");
    }

    pub fn subscribe(&self) -> ProgressStream {
        self.inner.progress.subscribe()
    }

    /// Runs the checks that precede dispatch without touching any device.
    pub fn preflight(&self, step: &Step) -> Result<(), EngineError> {
        let plan = scheduler::plan_step(&self.inner, step)?;
        plan.check_feasible(step, &plan.fusion(&self.inner))
    }

    pub fn step_state(&self, step_id: &str) -> Option<StepExecutionState> {
        let states = self.inner.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(step_id).cloned()
    }

    pub fn step_states(&self) -> Vec<StepExecutionState> {
        let states = self.inner.states.lock().unwrap_or_else(|e| e.into_inner());
        states.values().cloned().collect()
    }

    pub fn safety_level(&self) -> SafetyLevel {
        let monitor = self.inner.safety.lock().unwrap_or_else(|e| e.into_inner());
        monitor.level()
    }

    pub fn safety_events(&self) -> Vec<SafetyEventRecord> {
        let monitor = self.inner.safety.lock().unwrap_or_else(|e| e.into_inner());
        monitor.get_event_history().to_vec()
    }
}

async fn wait_terminal(rx: &mut watch::Receiver<Option<StepState>>) -> Option<StepState> {
    match rx.wait_for(Option::is_some).await {
        Ok(state) => *state,
        Err(_) => None,
    }
}
