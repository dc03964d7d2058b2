//! One scheduler session per run: explicit construction, explicit teardown.
//!
//! Submissions and the dispatch tick share a single mutex over the
//! scheduling state; they never interleave inside it. Completion
//! notifications leave through the bounded notifier pool so the dispatch
//! thread is never blocked on a peer.
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::adaptive::AdaptivePlacement;
use crate::clock::VirtualClock;
use crate::dag::Workflow;
use crate::dispatcher::{
    dispatch_tick, DispatchContext, PlacementStrategy, PreemptionMode, SchedState,
};
use crate::error::SchedulerError;
use crate::mobility::{MobilityModel, PositionFeed, WalkMode};
use crate::offload::{FuzzyOffload, NeverOffload, OffloadPolicy, ProbabilisticOffload};
use crate::peer::{
    CompletionSink, FogNode, NotifierPool, OffloadedTask, PeerDirectory, PeerLink,
};
use crate::planner::plan_workflow;
use crate::processor::ProcessorSpec;
use crate::report::{build_run_report, RunReport};
use crate::task::{Placement, Task, REMOTE_PROCESSOR};
use crate::task_loader::PeriodicTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Adaptive,
    HeftEdf,
    Random,
    Fuzzy,
}

impl PolicyKind {
    pub fn from_name(name: &str) -> Result<PolicyKind, SchedulerError> {
        match name.to_ascii_lowercase().as_str() {
            "adaptive" => Ok(PolicyKind::Adaptive),
            "heft_edf" => Ok(PolicyKind::HeftEdf),
            "random" => Ok(PolicyKind::Random),
            "fuzzy" => Ok(PolicyKind::Fuzzy),
            _ => Err(SchedulerError::Configuration(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Adaptive => "adaptive",
            PolicyKind::HeftEdf => "heft_edf",
            PolicyKind::Random => "random",
            PolicyKind::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Callback address this tier hands to peers on offload.
    pub address: String,
    pub time_scale: f64,
    /// Run horizon in virtual milliseconds.
    pub total_time: i64,
    /// Periodic spawn suppression horizon in virtual milliseconds.
    pub scheduler_horizon: i64,
    pub bus_bandwidth: i64,
    pub preemption: PreemptionMode,
    pub processor: ProcessorSpec,
    pub walk: WalkMode,
    pub walk_speed: f64,
    pub max_position: (i64, i64),
    pub notifier_workers: usize,
    pub rng_seed: u64,
    pub fogs: Vec<FogNode>,
    pub cloud: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            address: "edge:8000".to_string(),
            time_scale: 1.0,
            total_time: 100_000,
            scheduler_horizon: 50_000,
            bus_bandwidth: 100,
            preemption: PreemptionMode::Lazy,
            processor: ProcessorSpec::default(),
            walk: WalkMode::Random,
            walk_speed: 1.0,
            max_position: (1000, 1000),
            notifier_workers: 2,
            rng_seed: 42,
            fogs: Vec::new(),
            cloud: None,
        }
    }
}

fn build_strategy(kind: PolicyKind) -> PlacementStrategy {
    match kind {
        PolicyKind::Adaptive => PlacementStrategy::Adaptive(Box::new(AdaptivePlacement::new())),
        PolicyKind::HeftEdf => PlacementStrategy::EdfPartition,
        PolicyKind::Random => PlacementStrategy::Uniform,
        PolicyKind::Fuzzy => PlacementStrategy::FirstIdle,
    }
}

fn build_offload(kind: PolicyKind) -> Box<dyn OffloadPolicy> {
    match kind {
        PolicyKind::Adaptive => Box::new(NeverOffload),
        PolicyKind::HeftEdf | PolicyKind::Random => Box::<ProbabilisticOffload>::default(),
        PolicyKind::Fuzzy => Box::new(FuzzyOffload),
    }
}

pub struct SchedulerSession {
    config: SessionConfig,
    state: Arc<Mutex<SchedState>>,
    clock: Arc<Mutex<VirtualClock>>,
    running: Arc<AtomicBool>,
    mobility: Arc<Mutex<MobilityModel>>,
    directory: Arc<dyn PeerDirectory>,
    link: Arc<dyn PeerLink>,
    notifier: Arc<NotifierPool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    run_label: Mutex<String>,
    policy: Mutex<Option<PolicyKind>>,
}

impl SchedulerSession {
    pub fn new(
        config: SessionConfig,
        directory: Arc<dyn PeerDirectory>,
        link: Arc<dyn PeerLink>,
        sink: Arc<dyn CompletionSink>,
    ) -> SchedulerSession {
        let state = SchedState::new(
            config.processor.build(),
            config.preemption,
            config.scheduler_horizon,
            config.bus_bandwidth,
        );
        let mut seed_rng = StdRng::seed_from_u64(config.rng_seed);
        let start_position = (
            seed_rng.random_range(0..=config.max_position.0),
            seed_rng.random_range(0..=config.max_position.1),
        );
        let mobility = MobilityModel::new(config.walk, start_position, config.max_position);
        let notifier = Arc::new(NotifierPool::new(config.notifier_workers, 64, sink));
        let clock = VirtualClock::new(config.time_scale);

        SchedulerSession {
            config,
            state: Arc::new(Mutex::new(state)),
            clock: Arc::new(Mutex::new(clock)),
            running: Arc::new(AtomicBool::new(false)),
            mobility: Arc::new(Mutex::new(mobility)),
            directory,
            link,
            notifier,
            workers: Mutex::new(Vec::new()),
            run_label: Mutex::new(String::new()),
            policy: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts a run under the named policy. An unknown policy fails only
    /// this call; nothing else is touched.
    pub fn start(&self, policy_name: &str, label: &str) -> Result<(), SchedulerError> {
        let kind = PolicyKind::from_name(policy_name)?;
        self.shutdown();
        self.clear();
        *self.policy.lock().unwrap() = Some(kind);
        *self.run_label.lock().unwrap() = label.to_string();
        self.clock.lock().unwrap().restart();
        self.running.store(true, Ordering::SeqCst);
        info!("session started: policy={} label={}", kind.as_str(), label);

        let tick_sleep = Duration::from_secs_f64((0.001 / self.config.time_scale).max(1e-5));

        let dispatch = {
            let state = Arc::clone(&self.state);
            let clock = Arc::clone(&self.clock);
            let running = Arc::clone(&self.running);
            let position_feed: Arc<dyn PositionFeed> = self.mobility.clone();
            let directory = Arc::clone(&self.directory);
            let link = Arc::clone(&self.link);
            let notifier = Arc::clone(&self.notifier);
            let address = self.config.address.clone();
            let total_time = self.config.total_time;
            let seed = self.config.rng_seed;
            thread::spawn(move || {
                run_dispatch_loop(
                    state, clock, running, position_feed, directory, link, notifier, kind,
                    address, total_time, tick_sleep, seed,
                );
            })
        };

        let walk = {
            let mobility = Arc::clone(&self.mobility);
            let running = Arc::clone(&self.running);
            let speed = self.config.walk_speed;
            let seed = self.config.rng_seed.wrapping_add(1);
            thread::spawn(move || run_walk_loop(mobility, running, speed, tick_sleep, seed))
        };

        self.workers.lock().unwrap().extend([dispatch, walk]);
        Ok(())
    }

    /// Stops the run and joins the background threads. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Resets all scheduling state ahead of a new run.
    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }

    pub fn submit_periodic(&self, templates: Vec<PeriodicTemplate>) {
        let arrival = self.clock.lock().unwrap().now_ms();
        let mut state = self.state.lock().unwrap();
        for template in templates {
            let mut task = Task::new(
                template.id,
                template.criticality,
                template.cost,
                template.memory,
            );
            task.deadline = template.deadline;
            task.period = Some(template.period.unwrap_or(template.deadline));
            task.arrival = arrival;
            task.absolute_deadline = arrival + template.deadline;
            let key = state.arena.insert(task);
            state.enqueue(key, arrival);
        }
    }

    /// Validates and plans each workflow synchronously, then makes its
    /// subtasks visible to the dispatcher with their derived deadlines.
    pub fn submit_workflows(&self, workflows: Vec<Workflow>) -> Result<(), SchedulerError> {
        for workflow in &workflows {
            workflow.validate()?;
        }
        let mut state = self.state.lock().unwrap();
        for mut workflow in workflows {
            let plan = plan_workflow(&workflow, &state.processors, state.bus_bandwidth);
            let slot = state.workflows.len();
            workflow.task_keys.clear();
            for node in 0..workflow.subtask_count() {
                let subtask = workflow.graph[petgraph::graph::NodeIndex::new(node)].clone();
                let mut task =
                    Task::new(subtask.id, subtask.criticality, subtask.cost, subtask.memory);
                task.workflow_id = workflow.id;
                task.workflow_slot = Some((slot, node));
                task.arrival = workflow.arrival;
                task.deadline = plan.subtasks[node].deadline;
                task.absolute_deadline = workflow.arrival + plan.subtasks[node].deadline;
                let key = state.arena.insert(task);
                workflow.task_keys.push(key);
            }
            let keys = workflow.task_keys.clone();
            let arrival = workflow.arrival;
            state.workflows.push(workflow);
            for key in keys {
                state.enqueue(key, arrival);
            }
        }
        Ok(())
    }

    /// A task pushed from a peer tier; this tier owns it from here on.
    pub fn submit_task(&self, origin: &str, task: OffloadedTask) {
        let arrival = self.clock.lock().unwrap().now_ms();
        let mut state = self.state.lock().unwrap();
        let mut accepted = Task::new(task.id, task.criticality, task.cost, task.memory);
        accepted.workflow_id = task.workflow_id;
        accepted.job = task.job_id;
        accepted.arrival = arrival;
        accepted.deadline = task.absolute_deadline - arrival;
        accepted.absolute_deadline = task.absolute_deadline;
        accepted.origin = Some(origin.to_string());
        let key = state.arena.insert(accepted);
        state.enqueue(key, arrival);
    }

    /// Completion callback for a task this tier offloaded earlier.
    pub fn notify_complete(&self, task_id: i64, workflow_id: i64, job_id: i64) {
        let now = self.clock.lock().unwrap().now_ms();
        let mut state = self.state.lock().unwrap();
        match state.arena.find_job(task_id, workflow_id, job_id) {
            Some(key) => {
                let task = &mut state.arena[key];
                task.remaining_cost = 0;
                task.placements = vec![Placement {
                    processor: REMOTE_PROCESSOR,
                    start: now,
                    end: now,
                }];
                task.latency = task.offloaded_at.map(|sent| now - sent);
            }
            None => warn!(
                "completion for unknown task {} (workflow {}, job {})",
                task_id, workflow_id, job_id
            ),
        }
    }

    pub fn last_positions(&self, max_count: usize) -> Vec<(i64, i64)> {
        self.mobility.lock().unwrap().last_positions(max_count).to_vec()
    }

    pub fn report(&self) -> RunReport {
        let state = self.state.lock().unwrap();
        let policy = self
            .policy
            .lock()
            .unwrap()
            .map(|kind| kind.as_str().to_string())
            .unwrap_or_default();
        let label = self.run_label.lock().unwrap().clone();
        build_run_report(&state, &policy, &label, self.config.total_time)
    }
}

impl Drop for SchedulerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_dispatch_loop(
    state: Arc<Mutex<SchedState>>,
    clock: Arc<Mutex<VirtualClock>>,
    running: Arc<AtomicBool>,
    position_feed: Arc<dyn PositionFeed>,
    directory: Arc<dyn PeerDirectory>,
    link: Arc<dyn PeerLink>,
    notifier: Arc<NotifierPool>,
    kind: PolicyKind,
    address: String,
    total_time: i64,
    tick_sleep: Duration,
    seed: u64,
) {
    let mut strategy = build_strategy(kind);
    let offload = build_offload(kind);
    let mut rng = StdRng::seed_from_u64(seed);

    while running.load(Ordering::SeqCst) {
        let now = clock.lock().unwrap().now_ms();
        if now > total_time {
            break;
        }
        let position = position_feed.current_position();
        let fogs = directory.fog_nodes();
        let cloud = directory.cloud_address();
        let notes = {
            let mut guard = state.lock().unwrap();
            guard.position = position;
            let ctx = DispatchContext {
                now,
                fogs: &fogs,
                cloud,
                link: link.as_ref(),
                self_address: &address,
            };
            dispatch_tick(&mut guard, &ctx, &mut strategy, offload.as_ref(), &mut rng)
        };
        for note in notes {
            notifier.dispatch(note);
        }
        thread::sleep(tick_sleep);
    }
    running.store(false, Ordering::SeqCst);
    info!("dispatch loop stopped");
}

fn run_walk_loop(
    mobility: Arc<Mutex<MobilityModel>>,
    running: Arc<AtomicBool>,
    speed: f64,
    tick_sleep: Duration,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pending = 0.0;
    while running.load(Ordering::SeqCst) {
        pending += speed;
        if pending >= 1.0 {
            let steps = pending as usize;
            pending -= steps as f64;
            mobility.lock().unwrap().step(steps, &mut rng);
        }
        thread::sleep(tick_sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Subtask;
    use crate::peer::{LogSink, NullLink, StaticDirectory};
    use crate::task::Criticality;

    fn create_session(config: SessionConfig) -> SchedulerSession {
        SchedulerSession::new(
            config,
            Arc::new(StaticDirectory::default()),
            Arc::new(NullLink),
            Arc::new(LogSink),
        )
    }

    fn template(id: i64, cost: i64, deadline: i64) -> PeriodicTemplate {
        PeriodicTemplate {
            id,
            criticality: Criticality::Firm,
            cost,
            memory: 16,
            deadline,
            period: None,
        }
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let session = create_session(SessionConfig::default());
        let err = session.start("simulated_annealing", "trial").unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert!(!session.is_running());
    }

    #[test]
    fn test_periodic_submission_stamps_arrival_and_deadline() {
        let session = create_session(SessionConfig::default());
        session.submit_periodic(vec![template(3, 100, 500)]);

        let report = session.report();
        assert_eq!(report.tasks.len(), 1);
        let task = &report.tasks[0];
        assert_eq!(task.task_id, 3);
        assert_eq!(task.absolute_deadline, task.arrival_time + 500);
        assert_eq!(task.remaining_cost, 100);
    }

    #[test]
    fn test_workflow_submission_derives_subtask_deadlines() {
        let session = create_session(SessionConfig {
            processor: ProcessorSpec::new(1, 1.0, 2048, 8.0, 2.7),
            ..SessionConfig::default()
        });
        let mut workflow = Workflow::new(0, 1000, 0);
        workflow.add_subtask(Subtask::new(0, Criticality::Soft, 100, 16));
        workflow.add_subtask(Subtask::new(1, Criticality::Soft, 100, 16));
        workflow.add_dependency(0, 1, 0).unwrap();
        session.submit_workflows(vec![workflow]).unwrap();

        let report = session.report();
        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.tasks[0].deadline, 500);
        assert_eq!(report.tasks[1].deadline, 1000);
    }

    #[test]
    fn test_cyclic_workflow_fails_submission() {
        let session = create_session(SessionConfig::default());
        let mut workflow = Workflow::new(0, 1000, 0);
        workflow.add_subtask(Subtask::new(0, Criticality::Soft, 100, 16));
        workflow.add_subtask(Subtask::new(1, Criticality::Soft, 100, 16));
        workflow.add_dependency(0, 1, 0).unwrap();
        workflow.add_dependency(1, 0, 0).unwrap();

        let err = session.submit_workflows(vec![workflow]).unwrap_err();
        assert!(matches!(err, SchedulerError::NotRegistered(_)));
        assert!(session.report().tasks.is_empty());
    }

    #[test]
    fn test_remote_completion_closes_out_offloaded_task() {
        let session = create_session(SessionConfig::default());
        session.submit_task(
            "fog:9000",
            OffloadedTask {
                id: 11,
                workflow_id: -1,
                job_id: 0,
                criticality: Criticality::Soft,
                cost: 100,
                memory: 16,
                absolute_deadline: 5000,
            },
        );
        session.notify_complete(11, -1, 0);

        let report = session.report();
        let task = &report.tasks[0];
        assert_eq!(task.remaining_cost, 0);
        assert_eq!(task.placements.len(), 1);
        assert_eq!(task.placements[0].processor, REMOTE_PROCESSOR);
    }

    #[test]
    fn test_run_to_horizon_places_periodic_jobs() {
        let config = SessionConfig {
            time_scale: 10.0,
            total_time: 2_000,
            scheduler_horizon: 2_000,
            ..SessionConfig::default()
        };
        let session = create_session(config);
        session.start("fuzzy", "smoke").unwrap();
        session.submit_periodic(vec![template(0, 50, 200)]);

        // 2000 virtual ms at 10x is 200ms of wall time.
        thread::sleep(Duration::from_millis(400));
        assert!(!session.is_running());
        session.shutdown();

        let report = session.report();
        assert!(report.tasks.len() >= 2);
        assert_eq!(report.tasks[0].remaining_cost, 0);
        assert!(!report.tasks[0].placements.is_empty());
        assert_eq!(report.policy, "fuzzy");
    }
}
