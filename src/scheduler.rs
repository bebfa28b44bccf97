//! Step Scheduler.
//!
//! Each step moves through `Pending -> Dispatched -> Monitoring` and ends in
//! exactly one of `Completed`, `Failed` or `Aborted`. Monitoring is a pull
//! loop on a fixed tick: abort check, read, fuse, safety, evaluate, control.

use crate::controller::{ControlLoop, PidController};
use crate::driver::{DeviceCommand, DeviceStatus, SensorReading};
use crate::error::{EngineError, ToleranceExceeded};
use crate::evaluator;
use crate::fusion::{is_builtin, FusedSignal, FusedSnapshot, SensorFusion, CONFIRMED_SIGNAL, ELAPSED_SIGNAL};
use crate::progress::ProgressKind;
use crate::recipe::{Dependency, DeviceProfile, SensorPriority, SensorSpec, Step, Target};
use crate::safety::{Observation, SafetyLevel, SafetyLimits};
use crate::session::SessionInner;
use crate::translator::DeviceLease;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Param giving a timer-only step its length.
pub const DURATION_PARAM: &str = "duration_s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Dispatched,
    Monitoring,
    Completed,
    Failed,
    Aborted,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Aborted
        )
    }

    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Pending, Dispatched | Failed | Aborted)
                | (Dispatched, Monitoring | Failed | Aborted)
                | (Monitoring, Completed | Failed | Aborted)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionState {
    pub step_id: String,
    pub state: StepState,
    pub created_at_ms: u64,
    pub dispatched_at_ms: Option<u64>,
    pub monitoring_since_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub ticks: u64,
    pub consecutive_satisfied: u32,
    pub last_snapshot: Option<FusedSnapshot>,
    pub error: Option<EngineError>,
    pub warnings: Vec<ToleranceExceeded>,
    /// Command sends, retries included.
    pub attempts: u32,
    #[serde(skip)]
    pub controller: Option<PidController>,
}

impl StepExecutionState {
    pub fn new(step_id: &str, now_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            state: StepState::Pending,
            created_at_ms: now_ms,
            dispatched_at_ms: None,
            monitoring_since_ms: None,
            finished_at_ms: None,
            ticks: 0,
            consecutive_satisfied: 0,
            last_snapshot: None,
            error: None,
            warnings: Vec::new(),
            attempts: 0,
            controller: None,
        }
    }

    pub fn transition(&mut self, next: StepState, now_ms: u64) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        match next {
            StepState::Dispatched => self.dispatched_at_ms = Some(now_ms),
            StepState::Monitoring => self.monitoring_since_ms = Some(now_ms),
            _ => {}
        }
        if next.is_terminal() {
            self.finished_at_ms = Some(now_ms);
            self.controller = None;
        }
        self.state = next;
        Ok(())
    }

    pub fn elapsed_s(&self, now_ms: u64) -> f64 {
        self.monitoring_since_ms
            .map_or(0.0, |t| now_ms.saturating_sub(t) as f64 / 1000.0)
    }
}

/// Everything resolved before the first command leaves the engine.
#[derive(Debug)]
pub struct StepPlan {
    pub conditions: BTreeMap<String, Target>,
    pub sensors: Vec<SensorSpec>,
    pub device: Option<(DeviceProfile, DeviceCommand)>,
    pub limits: SafetyLimits,
    pub control: Option<ControlLoop>,
}

impl StepPlan {
    /// Rejects targets that can only be met above a safety ceiling.
    pub fn check_feasible(&self, step: &Step, fusion: &SensorFusion) -> Result<(), EngineError> {
        evaluator::check_feasible(&step.id, &self.conditions, &step.tolerance, |signal| {
            fusion
                .kind(signal)
                .and_then(|kind| self.limits.ceiling(kind))
                .map(|(_, ceiling)| ceiling)
        })
    }

    pub(crate) fn fusion(&self, session: &SessionInner) -> SensorFusion {
        SensorFusion::new(session.config.fusion.clone(), self.sensors.iter().cloned())
    }
}

/// Completion conditions, with a timer-only step expressed as `elapsed_s`.
pub fn effective_conditions(step: &Step) -> BTreeMap<String, Target> {
    let mut conditions = step.done_when.clone();
    if conditions.is_empty() {
        if let Some(duration) = step.number_param(DURATION_PARAM) {
            conditions.insert(ELAPSED_SIGNAL.to_string(), Target::AtLeast(duration));
        }
    }
    conditions
}

/// Sensors a step observes: the ones for signals it references, the
/// session-wide ones, and the ones bound to its device or to the step itself.
pub fn relevant_sensors(step: &Step, specs: &[SensorSpec]) -> Vec<SensorSpec> {
    let mut referenced: BTreeSet<String> = effective_conditions(step)
        .into_keys()
        .chain(step.guidance.keys().cloned())
        .chain(ControlLoop::from_step(step).map(|c| c.signal))
        .collect();

    let selected = |spec: &SensorSpec, referenced: &BTreeSet<String>| {
        referenced.contains(&spec.signal)
            || match spec.target.as_deref() {
                None => true,
                Some(target) => {
                    target == step.id || step.device_profile_ref.as_deref() == Some(target)
                }
            }
    };

    // pull in the inputs of selected estimators until nothing new appears
    loop {
        let inputs: Vec<String> = specs
            .iter()
            .filter(|s| s.is_virtual() && selected(s, &referenced))
            .filter_map(|s| s.model.as_ref().map(|m| m.inputs().to_string()))
            .filter(|input| !referenced.contains(input))
            .collect();
        if inputs.is_empty() {
            break;
        }
        referenced.extend(inputs);
    }

    specs
        .iter()
        .filter(|s| selected(s, &referenced))
        .cloned()
        .collect()
}

/// Fail-fast checks; no device sees a command if any of these fail.
pub(crate) fn plan_step(session: &SessionInner, step: &Step) -> Result<StepPlan, EngineError> {
    for dependency in step.dependencies() {
        if let Dependency::Ingredient(ingredient) = dependency {
            if let Some(inventory) = &session.inventory {
                if !inventory.contains(&ingredient) {
                    return Err(EngineError::IngredientUnavailable {
                        step: step.id.clone(),
                        ingredient,
                    });
                }
            }
        }
    }

    let conditions = effective_conditions(step);
    let sensors = relevant_sensors(step, &session.sensor_specs);
    let probe = SensorFusion::new(session.config.fusion.clone(), sensors.iter().cloned());
    let control = ControlLoop::from_step(step);

    let needed = conditions
        .keys()
        .map(String::as_str)
        .chain(control.as_ref().map(|c| c.signal.as_str()));
    for signal in needed {
        if !is_builtin(signal) && !probe.can_provide(signal) {
            return Err(EngineError::MissingSignal {
                step: step.id.clone(),
                signal: signal.to_string(),
            });
        }
    }

    let device = match step.device_profile_ref.as_deref() {
        Some(id) => {
            let profile = session
                .profiles
                .get(id)
                .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?;
            let command = session
                .translator
                .translate(step, profile, &BTreeMap::new())?;
            Some((profile.clone(), command))
        }
        None => None,
    };
    let limits = SafetyLimits::for_device(
        &session.config.safety,
        device.as_ref().map(|(profile, _)| profile),
    );

    Ok(StepPlan {
        conditions,
        sensors,
        device,
        limits,
        control,
    })
}

/// Resolves once the session interlock trips.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|tripped| *tripped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

enum Outcome {
    Completed,
    Failed(EngineError),
    Aborted(EngineError),
}

struct StepRun<'a> {
    session: &'a SessionInner,
    step: &'a Step,
    exec: StepExecutionState,
    abort: watch::Receiver<bool>,
}

impl<'a> StepRun<'a> {
    fn now(&self) -> u64 {
        self.session.clock.now_ms()
    }

    fn transition(&mut self, next: StepState) {
        let now = self.now();
        if let Err(e) = self.exec.transition(next, now) {
            error!(step = %self.exec.step_id, error = %e, "rejected transition");
            return;
        }
        info!(step = %self.exec.step_id, state = ?next, "step transition");
        self.session.record(&self.exec);
        self.emit(ProgressKind::Transition, None);
    }

    fn emit(&self, kind: ProgressKind, snapshot: Option<FusedSnapshot>) {
        self.session
            .progress
            .publish(self.now(), &self.exec.step_id, self.exec.state, kind, snapshot);
    }

    fn abort_reason(&self) -> EngineError {
        match self.session.interlock.reason() {
            Some(reason @ EngineError::Aborted(_)) => reason,
            Some(reason) => EngineError::Aborted(reason.to_string()),
            None => EngineError::Aborted("session stopped".into()),
        }
    }

    /// Sends through the lease, retrying transient failures with backoff.
    async fn send_with_retry(
        &mut self,
        lease: &mut DeviceLease,
        command: &DeviceCommand,
    ) -> Result<(), Outcome> {
        let session = self.session;
        let devices = &session.config.devices;
        let ack_timeout = Duration::from_millis(devices.ack_timeout_ms);
        let mut retries = 0;
        loop {
            self.exec.attempts += 1;
            let driver = session.devices.as_ref();
            let now = self.now();
            let mut abort = self.abort.clone();
            let sent = tokio::select! {
                biased;
                () = aborted(&mut abort) => return Err(Outcome::Aborted(self.abort_reason())),
                sent = lease.send(driver, command.clone(), now, ack_timeout) => sent,
            };
            match sent {
                Ok(ack) => {
                    debug!(step = %self.exec.step_id, device = %ack.device_id, sequence = ack.sequence, "command acknowledged");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && retries < devices.retry_limit => {
                    retries += 1;
                    let backoff = devices.backoff(retries);
                    warn!(step = %self.exec.step_id, device = %lease.device_id(), error = %e, retry = retries, backoff_ms = backoff.as_millis() as u64, "retrying command");
                    let interrupted = tokio::select! {
                        biased;
                        () = aborted(&mut self.abort) => true,
                        () = tokio::time::sleep(backoff) => false,
                    };
                    if interrupted {
                        return Err(Outcome::Aborted(self.abort_reason()));
                    }
                }
                Err(e) => return Err(Outcome::Failed(e)),
            }
        }
    }

    async fn dispatch(&mut self, plan: &StepPlan) -> Result<Option<DeviceLease>, Outcome> {
        self.transition(StepState::Dispatched);
        for hazard in &self.step.hazards {
            if self.step.non_standard_hazards().any(|h| h == hazard) {
                warn!(step = %self.step.id, hazard = %hazard, "non-standard hazard");
            } else {
                info!(step = %self.step.id, hazard = %hazard, "hazard");
            }
        }

        let Some((profile, command)) = &plan.device else {
            return Ok(None);
        };
        let translator = &self.session.translator;
        let acquired = tokio::select! {
            biased;
            () = aborted(&mut self.abort) => None,
            lease = translator.acquire(&profile.id) => Some(lease),
        };
        let Some(mut lease) = acquired else {
            return Err(Outcome::Aborted(self.abort_reason()));
        };
        self.send_with_retry(&mut lease, command).await?;
        Ok(Some(lease))
    }

    async fn read_sensors(&self, fusion: &SensorFusion, deadline: tokio::time::Instant) -> Vec<SensorReading> {
        let mut reads = JoinSet::new();
        for id in fusion.driver_sensors() {
            let driver = Arc::clone(&self.session.sensors);
            let id = id.to_string();
            reads.spawn(async move { driver.read(&id).await });
        }

        let mut readings = Vec::new();
        // reads missing the deadline count as stale
        while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, reads.join_next()).await {
            match joined {
                Ok(Ok(reading)) => readings.push(reading),
                Ok(Err(e)) => debug!(step = %self.step.id, error = %e, "sensor read failed"),
                Err(e) => debug!(step = %self.step.id, error = %e, "sensor read task failed"),
            }
        }
        readings
    }

    async fn device_status(&self, device: &str) -> Result<DeviceStatus, EngineError> {
        let timeout = Duration::from_millis(self.session.config.devices.ack_timeout_ms);
        match tokio::time::timeout(timeout, self.session.devices.status(device)).await {
            Ok(status) => status,
            Err(_) => Err(EngineError::offline(device, "status request timed out")),
        }
    }

    fn snapshot(&self, fusion: &SensorFusion, now: u64) -> FusedSnapshot {
        let elapsed = self.exec.elapsed_s(now);
        let mut snapshot = fusion.fuse_all(now, elapsed);
        snapshot.insert(FusedSignal::exact(ELAPSED_SIGNAL, elapsed, "clock", now));
        let confirmed = if self.session.is_confirmed(&self.step.id) {
            1.0
        } else {
            0.0
        };
        snapshot.insert(FusedSignal::exact(CONFIRMED_SIGNAL, confirmed, "operator", now));
        snapshot
    }

    async fn monitor(
        &mut self,
        plan: &StepPlan,
        lease: &mut Option<DeviceLease>,
    ) -> Outcome {
        self.transition(StepState::Monitoring);
        let mut fusion = plan.fusion(self.session);
        if let Err(e) = plan.check_feasible(self.step, &fusion) {
            return Outcome::Failed(e);
        }

        let session = self.session;
        let config = &session.config;
        self.exec.controller = plan
            .control
            .clone()
            .map(|control| PidController::new(control, &config.control, self.step));

        let required: Vec<&str> = plan
            .conditions
            .keys()
            .map(String::as_str)
            .filter(|s| !is_builtin(s) && fusion.priority(s) == Some(SensorPriority::Required))
            .collect();
        let started = self.now();
        let mut last_seen: BTreeMap<&str, u64> = required.iter().map(|s| (*s, started)).collect();
        let mut active_warnings: BTreeSet<String> = BTreeSet::new();

        let period = config.monitoring.tick_period(self.step.phase.as_deref());
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let device_id = plan.device.as_ref().map(|(p, _)| p.id.clone());

        loop {
            tokio::select! {
                biased;
                () = aborted(&mut self.abort) => {}
                _ = ticker.tick() => {}
            }
            if self.session.interlock.is_tripped() {
                return Outcome::Aborted(self.abort_reason());
            }

            let now = self.now();
            self.exec.ticks += 1;

            // read
            let deadline = tokio::time::Instant::now() + period;
            let mut abort = self.abort.clone();
            let readings = tokio::select! {
                biased;
                () = aborted(&mut abort) => return Outcome::Aborted(self.abort_reason()),
                readings = self.read_sensors(&fusion, deadline) => readings,
            };
            for reading in readings {
                fusion.ingest(reading);
            }

            let mut statuses: BTreeMap<String, DeviceStatus> = BTreeMap::new();
            let telemetry_devices: BTreeSet<String> = fusion
                .telemetry_sensors()
                .map(|(_, device, _)| device.to_string())
                .chain(device_id.clone())
                .collect();
            for device in telemetry_devices {
                let status = tokio::select! {
                    biased;
                    () = aborted(&mut abort) => return Outcome::Aborted(self.abort_reason()),
                    status = self.device_status(&device) => status,
                };
                match status {
                    Ok(status) if status.online => {
                        statuses.insert(device, status);
                    }
                    Ok(_) | Err(_) if Some(&device) == device_id.as_ref() => {
                        if let Some(lease) = lease.as_mut() {
                            warn!(step = %self.step.id, device = %device, "device offline mid-step");
                            let Some(command) = lease.outstanding().cloned() else {
                                return Outcome::Failed(EngineError::offline(&device, "no command in flight"));
                            };
                            if let Err(outcome) = self.send_with_retry(lease, &command).await {
                                return outcome;
                            }
                        }
                    }
                    Ok(_) | Err(_) => debug!(step = %self.step.id, device = %device, "telemetry source unavailable"),
                }
            }
            let telemetry: Vec<SensorReading> = fusion
                .telemetry_sensors()
                .filter_map(|(sensor, device, key)| {
                    let value = statuses.get(device)?.telemetry.get(key)?;
                    Some(SensorReading::new(sensor, *value, now))
                })
                .collect();
            for reading in telemetry {
                fusion.ingest(reading);
            }

            // fuse
            let snapshot = self.snapshot(&fusion, now);

            // safety, always ahead of completion
            let observations: Vec<Observation<'_>> = snapshot
                .signals
                .values()
                .filter(|s| s.confidence > 0.0 && !is_builtin(&s.signal))
                .filter_map(|s| {
                    Some(Observation {
                        signal: &s.signal,
                        kind: fusion.kind(&s.signal)?,
                        value: s.value.as_scalar()?,
                    })
                })
                .collect();
            let runtime_ms = lease.as_ref().map_or(0, |l| l.runtime_ms(now));
            let origin = device_id.as_deref().unwrap_or(&self.step.id);
            let assessment = self.session.assess_safety(
                now,
                origin,
                &plan.limits,
                &observations,
                device_id.as_ref().and_then(|d| statuses.get(d)),
                runtime_ms,
            );
            if assessment.level >= SafetyLevel::Warning {
                self.emit(ProgressKind::Safety(assessment.level), Some(snapshot.clone()));
            }
            if let Some(violation) = assessment.violation {
                error!(step = %self.step.id, error = %violation, "safety veto");
                self.exec.last_snapshot = Some(snapshot);
                self.session.emergency_stop(violation.clone()).await;
                return Outcome::Aborted(violation);
            }

            // a trip raised elsewhere during this tick beats failure and completion
            if self.session.interlock.is_tripped() {
                self.exec.last_snapshot = Some(snapshot);
                return Outcome::Aborted(self.abort_reason());
            }

            // required signals
            for signal in &required {
                if snapshot.get(signal).is_some() {
                    last_seen.insert(*signal, now);
                } else if now.saturating_sub(last_seen[signal]) > config.sensors.sensor_timeout_ms {
                    self.exec.last_snapshot = Some(snapshot);
                    return Outcome::Failed(EngineError::SensorTimeout {
                        signal: signal.to_string(),
                        timeout_ms: config.sensors.sensor_timeout_ms,
                    });
                }
            }

            // evaluate
            if evaluator::evaluate(&plan.conditions, &self.step.tolerance, &snapshot) {
                self.exec.consecutive_satisfied += 1;
            } else {
                self.exec.consecutive_satisfied = 0;
            }
            if self.exec.consecutive_satisfied >= config.monitoring.debounce_ticks {
                self.exec.last_snapshot = Some(snapshot);
                return Outcome::Completed;
            }

            let violations = evaluator::guidance_violations(
                &self.step.id,
                &self.step.guidance,
                &self.step.tolerance,
                &snapshot,
            );
            let violating: BTreeSet<String> = violations.iter().map(|v| v.signal.clone()).collect();
            for warning in violations {
                if active_warnings.contains(&warning.signal) {
                    continue;
                }
                warn!(step = %self.step.id, signal = %warning.signal, value = warning.value, "guidance exceeded");
                self.exec.warnings.push(warning.clone());
                self.emit(ProgressKind::Warning(warning), None);
            }
            active_warnings = violating;

            // control
            if let (Some(lease), Some((profile, _))) = (lease.as_mut(), plan.device.as_ref()) {
                if let Err(outcome) = self.control(lease, profile, &snapshot, now).await {
                    return outcome;
                }
            }

            self.exec.last_snapshot = Some(snapshot.clone());
            self.session.record(&self.exec);
            self.emit(ProgressKind::Tick, Some(snapshot));
        }
    }

    async fn control(
        &mut self,
        lease: &mut DeviceLease,
        profile: &DeviceProfile,
        snapshot: &FusedSnapshot,
        now: u64,
    ) -> Result<(), Outcome> {
        let Some(pid) = self.exec.controller.as_mut() else {
            return Ok(());
        };
        let Some(measured) = snapshot.scalar(&pid.control().signal) else {
            return Ok(());
        };
        let output = pid.update(now, measured);
        let param = pid.control().output_param.clone();
        debug!(step = %self.step.id, param = %param, delta = output.delta, error = output.error, dampened = output.dampened, "control correction");

        let adjustments = BTreeMap::from([(param, output.delta)]);
        let command = match self
            .session
            .translator
            .translate(self.step, profile, &adjustments)
        {
            Ok(command) => command,
            Err(e) => {
                warn!(step = %self.step.id, error = %e, "control command rejected");
                return Ok(());
            }
        };
        if lease.outstanding().map(|c| &c.params) == Some(&command.params) {
            return Ok(());
        }
        self.send_with_retry(lease, &command).await
    }

    async fn finish(&mut self, outcome: Outcome, lease: Option<DeviceLease>) {
        let (state, error) = match outcome {
            Outcome::Completed => (StepState::Completed, None),
            Outcome::Failed(e) => (StepState::Failed, Some(e)),
            Outcome::Aborted(e) => (StepState::Aborted, Some(e)),
        };
        if let Some(e) = &error {
            match state {
                StepState::Failed => error!(step = %self.step.id, error = %e, "step failed"),
                _ => warn!(step = %self.step.id, error = %e, "step aborted"),
            }
        }
        self.exec.error = error;

        if state == StepState::Failed {
            if let Some(lease) = &lease {
                self.session.stop_device(lease.device_id()).await;
            }
        }
        drop(lease);
        self.transition(state);
    }
}

impl<'a> StepRun<'a> {
    fn start(session: &'a SessionInner, step: &'a Step) -> Self {
        let run = Self {
            session,
            step,
            exec: StepExecutionState::new(&step.id, session.clock.now_ms()),
            abort: session.interlock.subscribe(),
        };
        session.record(&run.exec);
        run.emit(ProgressKind::Transition, None);
        run
    }
}

/// Settles a step that never gets to run because of `error`.
pub(crate) async fn skip_step(
    session: &SessionInner,
    step: &Step,
    error: EngineError,
) -> StepExecutionState {
    let mut run = StepRun::start(session, step);
    let outcome = if session.interlock.is_tripped() {
        Outcome::Aborted(run.abort_reason())
    } else {
        Outcome::Failed(error)
    };
    run.finish(outcome, None).await;
    run.exec
}

/// Drives one step to a terminal state.
pub(crate) async fn run_step(session: &SessionInner, step: &Step) -> StepExecutionState {
    let mut run = StepRun::start(session, step);

    if session.interlock.is_tripped() {
        let reason = run.abort_reason();
        run.finish(Outcome::Aborted(reason), None).await;
        return run.exec;
    }

    if let Some(Dependency::StepResult(dependency)) = step
        .dependencies()
        .find(|d| matches!(d, Dependency::StepResult(id) if session.state_of(id) != Some(StepState::Completed)))
    {
        let error = EngineError::DependencyFailed {
            step: step.id.clone(),
            dependency,
        };
        run.finish(Outcome::Failed(error), None).await;
        return run.exec;
    }

    let plan = match plan_step(session, step) {
        Ok(plan) => plan,
        Err(e) => {
            run.finish(Outcome::Failed(e), None).await;
            return run.exec;
        }
    };

    let mut lease = match run.dispatch(&plan).await {
        Ok(lease) => lease,
        Err(outcome) => {
            run.finish(outcome, None).await;
            return run.exec;
        }
    };

    let outcome = run.monitor(&plan, &mut lease).await;
    run.finish(outcome, lease).await;
    run.exec
}
