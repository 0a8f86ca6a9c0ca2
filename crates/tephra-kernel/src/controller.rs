//! The model controller: one registry + one scheduler driven through the
//! run state machine `Idle → Running → Paused → Running → ... → Ended`.
//!
//! Initialization is two-pass (`early_init` must not depend on other
//! entities, `late_init` may), `start_up` seeds the event queue, dispatch
//! proceeds until the end-of-run event fires or the host cooperatively
//! pauses/stops, and `do_end` collects final outputs. `reset` rewinds the
//! instance between replications without re-parsing configuration.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use tephra_types::{
    EntityFlags, EntityId, EventOrder, OutputValue, Priority, Tick, TickLength, TraceKind,
    TraceRecord,
};

use crate::error::{KernelError, RuntimeError, ValidationError};
use crate::field::TypeRegistry;
use crate::process::{Action, Flow, ModelCtx, Predicate, Target};
use crate::registry::{EntityRegistry, DEFAULT_POOL_CAPACITY};
use crate::scheduler::{EventHandle, EventRecord, Scheduler};
use crate::trace::TraceListener;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of one model instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Tick at which entity start events are scheduled.
    pub start_tick: u64,
    /// Warm-up span; statistics are cleared at `start + warmup`.
    pub warmup_ticks: u64,
    /// Measured span; the run ends at `start + warmup + duration`.
    pub duration_ticks: u64,
    /// Simulated seconds per tick.
    pub tick_length: TickLength,
    /// When set, dispatch is throttled so wall-clock time approximates
    /// `elapsed_ticks * tick_length / factor`. Never affects order.
    pub real_time_factor: Option<f64>,
    /// Bound on each prototype's clone reuse pool.
    pub pool_capacity: usize,
    /// Seed of the replication's random stream.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            start_tick: 0,
            warmup_ticks: 0,
            duration_ticks: 1_000_000,
            tick_length: TickLength::default(),
            real_time_factor: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            seed: 0,
        }
    }
}

impl ModelConfig {
    pub fn with_start_tick(mut self, start_tick: u64) -> Self {
        self.start_tick = start_tick;
        self
    }

    pub fn with_warmup_ticks(mut self, warmup_ticks: u64) -> Self {
        self.warmup_ticks = warmup_ticks;
        self
    }

    pub fn with_duration_ticks(mut self, duration_ticks: u64) -> Self {
        self.duration_ticks = duration_ticks;
        self
    }

    pub fn with_tick_length(mut self, tick_length: TickLength) -> Self {
        self.tick_length = tick_length;
        self
    }

    pub fn with_real_time_factor(mut self, factor: f64) -> Self {
        self.real_time_factor = Some(factor);
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Tick at which the end-of-run event fires.
    pub fn end_tick(&self) -> u64 {
        self.start_tick + self.warmup_ticks + self.duration_ticks
    }
}

// ============================================================================
// Run State & Control
// ============================================================================

/// The run state machine. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Ended,
}

#[derive(Debug, Default)]
struct RunControlInner {
    pause: AtomicBool,
    stop: AtomicBool,
    progress_permille: AtomicU32,
}

/// Shared handle for cooperative control of an in-flight run. Pause and
/// stop take effect between dispatched events, never intra-event; progress
/// is published per-mille of the run duration and readable without any
/// lock.
#[derive(Debug, Clone, Default)]
pub struct RunControl(Arc<RunControlInner>);

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.0.pause.store(true, Ordering::Release);
    }

    pub fn request_resume(&self) {
        self.0.pause.store(false, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.0.stop.store(true, Ordering::Release);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.0.pause.load(Ordering::Acquire)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.stop.load(Ordering::Acquire)
    }

    /// Fraction of the run duration completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        f64::from(self.0.progress_permille.load(Ordering::Acquire)) / 1000.0
    }

    fn publish_progress(&self, fraction: f64) {
        let permille = (fraction.clamp(0.0, 1.0) * 1000.0) as u32;
        self.0.progress_permille.store(permille, Ordering::Release);
    }
}

// ============================================================================
// Model Controller
// ============================================================================

/// One runnable model instance.
pub struct ModelController {
    types: Arc<TypeRegistry>,
    config: ModelConfig,
    registry: EntityRegistry,
    scheduler: Scheduler,
    state: RunState,
    control: RunControl,
    rng: SmallRng,
    outputs: Vec<(String, OutputValue)>,
    trace: Option<Box<dyn TraceListener>>,
    error: Option<RuntimeError>,
    end_handle: Option<EventHandle>,
    last_wait_tick: Tick,
    last_wait_epoch: u64,
}

impl ModelController {
    pub fn new(types: Arc<TypeRegistry>, config: ModelConfig) -> Self {
        let registry = EntityRegistry::new(Arc::clone(&types), config.pool_capacity);
        let rng = SmallRng::seed_from_u64(config.seed);
        Self {
            types,
            config,
            registry,
            scheduler: Scheduler::new(),
            state: RunState::Idle,
            control: RunControl::new(),
            rng,
            outputs: Vec::new(),
            trace: None,
            error: None,
            end_handle: None,
            last_wait_tick: Tick::ZERO,
            last_wait_epoch: 0,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The cooperative control handle shared with the host.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn set_control(&mut self, control: RunControl) {
        self.control = control;
    }

    pub fn set_trace_listener(&mut self, listener: Box<dyn TraceListener>) {
        self.trace = Some(listener);
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Current simulation time.
    pub fn now(&self) -> Tick {
        self.scheduler.now()
    }

    /// Current simulation time in the derived seconds view.
    pub fn seconds_now(&self) -> f64 {
        self.config.tick_length.ticks_to_seconds(self.scheduler.now())
    }

    /// The dispatch-boundary error that ended the run, if any.
    pub fn error(&self) -> Option<&RuntimeError> {
        self.error.as_ref()
    }

    /// Declared outputs collected so far, drained.
    pub fn take_outputs(&mut self) -> Vec<(String, OutputValue)> {
        std::mem::take(&mut self.outputs)
    }

    fn ctx(&mut self) -> ModelCtx<'_> {
        ModelCtx {
            registry: &mut self.registry,
            scheduler: &mut self.scheduler,
            rng: &mut self.rng,
            outputs: &mut self.outputs,
            trace: &mut self.trace,
        }
    }

    fn emit_trace(&mut self, kind: TraceKind, priority: Priority, description: String) {
        if let Some(listener) = self.trace.as_mut() {
            listener.record(&TraceRecord {
                tick: self.scheduler.now(),
                priority,
                kind,
                description,
            });
        }
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// First initialization pass over all live entities. Resets per-run
    /// derived state; no inter-entity dependencies are allowed here.
    pub fn early_init(&mut self) -> Result<(), RuntimeError> {
        self.registry.clear_pools();
        let mut cursor = self.registry.walk();
        while let Some(id) = cursor.next(&self.registry) {
            self.invoke_init(id, InitPass::Early)?;
        }
        Ok(())
    }

    /// Second initialization pass; may assume `early_init` has completed
    /// on every entity.
    pub fn late_init(&mut self) -> Result<(), RuntimeError> {
        let mut cursor = self.registry.walk();
        while let Some(id) = cursor.next(&self.registry) {
            self.invoke_init(id, InitPass::Late)?;
        }
        Ok(())
    }

    fn invoke_init(&mut self, id: EntityId, pass: InitPass) -> Result<(), RuntimeError> {
        let (behavior, name) = match self.registry.get(id) {
            Some(e) => (self.types.get(e.type_key()).behavior(), e.name().to_string()),
            None => return Ok(()),
        };
        let result = {
            let mut ctx = self.ctx();
            match pass {
                InitPass::Early => behavior.early_init(&mut ctx, id),
                InitPass::Late => behavior.late_init(&mut ctx, id),
            }
        };
        result.map_err(|e| RuntimeError {
            tick: self.scheduler.now(),
            target: name,
            message: e.to_string(),
        })
    }

    /// Validates every entity; any failure blocks the start entirely.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let failures = self.registry.validate();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { failures })
        }
    }

    /// Runs both initialization passes and seeds the event queue: a start
    /// event per live entity at the configured start tick, an optional
    /// statistics-clear event after warm-up, and the end-of-run event.
    pub fn start_up(&mut self) -> Result<(), KernelError> {
        self.validate()?;
        self.early_init()?;
        self.late_init()?;

        let start = self.config.start_tick as i64;
        let mut cursor = self.registry.walk();
        let mut starts = Vec::new();
        while let Some(id) = cursor.next(&self.registry) {
            starts.push(id);
        }
        for id in starts {
            self.scheduler
                .schedule_ticks(
                    start,
                    Priority::NORMAL,
                    EventOrder::Fifo,
                    Target::entity(id, Action::Start),
                    None,
                )
                .map_err(KernelError::Structural)?;
        }
        if self.config.warmup_ticks > 0 {
            self.scheduler
                .schedule_ticks(
                    start + self.config.warmup_ticks as i64,
                    Priority::URGENT,
                    EventOrder::Fifo,
                    Target::StatisticsClear,
                    None,
                )
                .map_err(KernelError::Structural)?;
        }
        let end_handle = self.scheduler.new_handle();
        self.scheduler
            .schedule_ticks(
                self.config.end_tick() as i64,
                Priority::LAST,
                EventOrder::Fifo,
                Target::EndOfRun,
                Some(end_handle),
            )
            .map_err(KernelError::Structural)?;
        self.end_handle = Some(end_handle);

        tracing::debug!(
            entities = self.registry.live_count(),
            end_tick = self.config.end_tick(),
            "model started up"
        );
        Ok(())
    }

    /// Parks a pause request on a condition: the run pauses cooperatively
    /// once the predicate holds.
    pub fn register_pause_condition(&mut self, predicate: Predicate) {
        self.scheduler.schedule_until(Target::PauseRequest, predicate);
        self.emit_trace(
            TraceKind::ScheduleUntilEntered,
            Priority::NORMAL,
            "pause-request".to_string(),
        );
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatches events until the end-of-run event fires, the queue
    /// drains, or the host requests pause/stop. Returns the state the run
    /// settled in; a dispatch-boundary error marks the run errored and
    /// tears it down.
    pub fn run(&mut self) -> Result<RunState, RuntimeError> {
        if self.state == RunState::Ended {
            return Ok(RunState::Ended);
        }
        self.state = RunState::Running;
        let wall_start = Instant::now();
        let pace_origin = self.scheduler.now();

        loop {
            if self.control.is_stop_requested() {
                self.state = RunState::Ended;
                break;
            }
            if self.control.is_pause_requested() {
                self.state = RunState::Paused;
                break;
            }
            self.pump_condition_waits();
            let Some((tick, priority, record)) = self.scheduler.pop_next() else {
                // Queue drained; nothing can ever fire again.
                self.state = RunState::Ended;
                break;
            };
            self.pace(wall_start, pace_origin, tick);
            self.publish_progress(tick);
            if let Err(err) = self.dispatch(tick, priority, record) {
                self.error = Some(err.clone());
                self.state = RunState::Ended;
                tracing::warn!(tick = %tick, error = %err, "run errored at dispatch boundary");
                return Err(err);
            }
            if self.state != RunState::Running {
                break;
            }
        }
        if self.state == RunState::Ended {
            self.control.publish_progress(1.0);
        }
        Ok(self.state)
    }

    /// Convenience driver for headless execution: start up, dispatch to
    /// the end (sleeping through cooperative pauses), run final reporting,
    /// and drain the declared outputs.
    pub fn run_to_end(&mut self) -> Result<Vec<(String, OutputValue)>, KernelError> {
        self.start_up()?;
        loop {
            match self.run()? {
                RunState::Ended => break,
                _ => std::thread::sleep(std::time::Duration::from_millis(10)),
            }
        }
        self.do_end()?;
        Ok(self.take_outputs())
    }

    fn dispatch(
        &mut self,
        tick: Tick,
        priority: Priority,
        record: EventRecord,
    ) -> Result<(), RuntimeError> {
        match record.target {
            Target::EndOfRun => {
                self.emit_trace(TraceKind::EventFired, priority, "end-of-run".to_string());
                self.state = RunState::Ended;
                Ok(())
            }
            Target::PauseRequest => {
                self.state = RunState::Paused;
                Ok(())
            }
            Target::StatisticsClear => {
                self.emit_trace(
                    TraceKind::EventFired,
                    priority,
                    "statistics-clear".to_string(),
                );
                for id in self.registry.live_ids() {
                    self.invoke_action(tick, id, Action::ClearStatistics)?;
                }
                Ok(())
            }
            Target::Entity { entity, action } => {
                self.dispatch_entity(tick, priority, entity, action)
            }
        }
    }

    /// Invokes an entity action discarding its flow outcome (used for
    /// broadcast control events).
    fn invoke_action(
        &mut self,
        tick: Tick,
        entity: EntityId,
        action: Action,
    ) -> Result<(), RuntimeError> {
        let (behavior, name) = match self.registry.get(entity) {
            Some(e) if e.is_live() => {
                (self.types.get(e.type_key()).behavior(), e.name().to_string())
            }
            _ => return Ok(()),
        };
        let result = {
            let mut ctx = self.ctx();
            behavior.on_event(&mut ctx, entity, action)
        };
        result
            .map(|_| ())
            .map_err(|e| RuntimeError {
                tick,
                target: name,
                message: e.to_string(),
            })
    }

    fn dispatch_entity(
        &mut self,
        tick: Tick,
        priority: Priority,
        entity: EntityId,
        action: Action,
    ) -> Result<(), RuntimeError> {
        let (behavior, name) = match self.registry.get(entity) {
            Some(e) if e.is_live() => {
                (self.types.get(e.type_key()).behavior(), e.name().to_string())
            }
            // The target died between schedule and dispatch; the record is
            // consumed without effect.
            _ => return Ok(()),
        };

        let kind = if action == Action::Start {
            TraceKind::ProcessStarted
        } else {
            TraceKind::EventFired
        };
        self.emit_trace(kind, priority, format!("{name}:{action:?}"));

        let result = {
            let mut ctx = self.ctx();
            behavior.on_event(&mut ctx, entity, action)
        };
        let flow = result.map_err(|e| RuntimeError {
            tick,
            target: name.clone(),
            message: e.to_string(),
        })?;

        match flow {
            Flow::Done => {
                if let Some(e) = self.registry.get_mut(entity) {
                    e.set_process(None);
                }
                if action == Action::Start {
                    self.emit_trace(TraceKind::ProcessEnded, priority, name);
                }
            }
            Flow::Delay {
                ticks,
                priority: wait_priority,
                order,
            } => {
                let handle = match self.registry.get(entity).and_then(|e| e.process()) {
                    Some(h) => h,
                    None => self.scheduler.new_handle(),
                };
                self.scheduler
                    .schedule_ticks(
                        ticks as i64,
                        wait_priority,
                        order,
                        Target::entity(entity, action),
                        Some(handle),
                    )
                    .map_err(|e| RuntimeError {
                        tick,
                        target: name.clone(),
                        message: e.to_string(),
                    })?;
                if let Some(e) = self.registry.get_mut(entity) {
                    e.set_process(Some(handle));
                }
                self.emit_trace(TraceKind::WaitEntered, wait_priority, name);
            }
            Flow::Until(predicate) => {
                self.scheduler
                    .schedule_until(Target::entity(entity, action), predicate);
                self.emit_trace(TraceKind::ScheduleUntilEntered, priority, name);
            }
        }
        Ok(())
    }

    /// Re-evaluates parked conditional waits when the clock crossed a tick
    /// boundary or the registry changed; resolved targets are dispatched
    /// through the ordinary queue at the current tick.
    fn pump_condition_waits(&mut self) {
        if self.scheduler.waiting() == 0 {
            return;
        }
        let tick_moved = self.scheduler.now() != self.last_wait_tick;
        let epoch_moved = self.registry.change_epoch() != self.last_wait_epoch;
        if !tick_moved && !epoch_moved {
            return;
        }
        self.last_wait_tick = self.scheduler.now();
        self.last_wait_epoch = self.registry.change_epoch();

        let ready = self.scheduler.take_ready_waits(&self.registry);
        for target in ready {
            let description = target.describe(&self.registry);
            // Delay zero cannot fail.
            let _ = self.scheduler.schedule_ticks(
                0,
                Priority::NORMAL,
                EventOrder::Fifo,
                target,
                None,
            );
            self.emit_trace(
                TraceKind::ScheduleUntilResolved,
                Priority::NORMAL,
                description,
            );
        }
    }

    fn publish_progress(&self, tick: Tick) {
        let span = self.config.warmup_ticks + self.config.duration_ticks;
        if span == 0 {
            return;
        }
        let elapsed = tick.value().saturating_sub(self.config.start_tick);
        self.control
            .publish_progress(elapsed as f64 / span as f64);
    }

    /// Real-time pacing: sleeps so that wall-clock time approximates
    /// `elapsed_ticks * tick_length / factor`. Only affects when ticks are
    /// dispatched, never their relative order.
    fn pace(&self, wall_start: Instant, pace_origin: Tick, tick: Tick) {
        let Some(factor) = self.config.real_time_factor else {
            return;
        };
        if factor <= 0.0 {
            return;
        }
        let sim_seconds = self
            .config
            .tick_length
            .ticks_to_seconds(tick - pace_origin);
        let target = sim_seconds / factor;
        let elapsed = wall_start.elapsed().as_secs_f64();
        if target > elapsed {
            std::thread::sleep(std::time::Duration::from_secs_f64(target - elapsed));
        }
    }

    // ------------------------------------------------------------------
    // Teardown & Reset
    // ------------------------------------------------------------------

    /// Final reporting pass over all live entities, in any order.
    pub fn do_end(&mut self) -> Result<(), RuntimeError> {
        let mut cursor = self.registry.walk();
        while let Some(id) = cursor.next(&self.registry) {
            let (behavior, name) = match self.registry.get(id) {
                Some(e) => (self.types.get(e.type_key()).behavior(), e.name().to_string()),
                None => continue,
            };
            let result = {
                let mut ctx = self.ctx();
                behavior.do_end(&mut ctx, id)
            };
            result.map_err(|e| RuntimeError {
                tick: self.scheduler.now(),
                target: name,
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Rewinds the instance between replications: clears the scheduler,
    /// kills every generated-and-not-retained entity, and re-runs both
    /// initialization passes without starting dispatch.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        self.scheduler.clear();
        self.state = RunState::Idle;
        self.error = None;
        self.outputs.clear();
        self.end_handle = None;
        self.last_wait_tick = Tick::ZERO;
        self.last_wait_epoch = 0;
        self.control.publish_progress(0.0);
        self.rng = SmallRng::seed_from_u64(self.config.seed);

        let doomed: Vec<EntityId> = self
            .registry
            .live_ids()
            .into_iter()
            .filter(|&id| {
                self.registry.get(id).is_some_and(|e| {
                    e.flags().contains(EntityFlags::GENERATED)
                        && !e.flags().contains(EntityFlags::RETAINED)
                })
            })
            .collect();
        for id in doomed {
            self.registry.kill(id);
        }
        // Scheduler state is gone; stale continuation handles with it.
        for id in self.registry.live_ids() {
            if let Some(e) = self.registry.get_mut(id) {
                e.set_process(None);
            }
        }

        self.early_init()?;
        self.late_init()?;
        tracing::debug!(live = self.registry.live_count(), "model reset");
        Ok(())
    }

    /// Reseeds the replication random stream (used by the orchestrator
    /// between replications, before `reset`).
    pub fn reseed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
    }
}

#[derive(Clone, Copy)]
enum InitPass {
    Early,
    Late,
}

impl std::fmt::Debug for ModelController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelController")
            .field("state", &self.state)
            .field("now", &self.scheduler.now())
            .field("live", &self.registry.live_count())
            .finish_non_exhaustive()
    }
}
