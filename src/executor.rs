use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pagination::{PageProgress, PaginatedCaller};
use crate::sensor::{PokeOutcome, PollingSensor, SensorState};
use crate::{
    ExecutorConfig, FlowError, HttpClient, HttpRequest, RetryDecision, RunState, Task, TaskGraph,
    TaskKind, TaskOutput, TaskStatus,
};

/// Drives a frozen `TaskGraph` to completion.
///
/// A single coordinating loop owns the `RunState`; workers only run one
/// unit of work (a call, a sensor poke or a single page) and report back.
/// Retry delays and sensor intervals are timers that re-queue the task, and
/// each page of a paginated call is dispatched separately, so waiting never
/// holds a worker permit.
pub struct Executor {
    client: Arc<dyn HttpClient>,
    config: ExecutorConfig,
}

type Sensors = HashMap<String, (PollingSensor, SensorState)>;
type Pages = HashMap<String, (PaginatedCaller, PageProgress)>;

enum Work {
    Call,
    Poke {
        deadline: Option<Instant>,
        timeout: Duration,
    },
    Page(HttpRequest),
}

enum Event {
    Attempted { id: String, outcome: Outcome },
    Due { id: String, retry: bool },
}

enum Outcome {
    Completed(Result<TaskOutput, FlowError>),
    Poked(Result<bool, FlowError>),
    Paged(Result<(TaskOutput, Option<HttpRequest>), FlowError>),
}

impl Executor {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self::with_config(client, ExecutorConfig::default())
    }

    pub fn with_config(client: Arc<dyn HttpClient>, config: ExecutorConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn run(
        &self,
        graph: &TaskGraph,
        ctx: CancellationToken,
    ) -> Result<RunState, FlowError> {
        if !graph.is_frozen() {
            return Err(FlowError::GraphNotFrozen);
        }

        let mut state = RunState::new(graph.tasks().map(|task| task.id()));
        let workers = Arc::new(Semaphore::new(self.config.worker_count()));
        let mut in_flight: JoinSet<Event> = JoinSet::new();
        let mut sensors = Sensors::new();
        let mut pages = Pages::new();

        info!(
            tasks = graph.len(),
            workers = self.config.worker_count(),
            "starting run"
        );

        loop {
            for task in graph.ready_set(&state) {
                state.begin_attempt(task.id());
                debug!(task = %task.id(), "task ready");
                match Self::first_work(&task, &mut sensors, &mut pages) {
                    Ok(work) => self.dispatch(&mut in_flight, &workers, task, work),
                    Err(e) => self.settle(graph, &mut state, &mut in_flight, &task, Err(e)),
                }
            }

            if state.is_finished() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    in_flight.abort_all();
                    let skipped = state.cancel_remaining("run cancelled");
                    warn!(skipped, "run cancelled");
                    break;
                }
                joined = in_flight.join_next() => joined,
            };

            let event = match joined {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(FlowError::TaskExecution(format!("worker join error: {}", e)));
                }
                None => {
                    return Err(FlowError::TaskExecution(
                        "no work in flight but tasks remain unresolved".to_string(),
                    ));
                }
            };

            match event {
                Event::Due { id, retry } => {
                    let Some(task) = graph.get(&id) else {
                        continue;
                    };
                    let work = if retry {
                        state.begin_attempt(&id);
                        Self::first_work(task, &mut sensors, &mut pages)
                    } else {
                        Self::next_poke(&sensors, &id)
                    };
                    match work {
                        Ok(work) => self.dispatch(&mut in_flight, &workers, Arc::clone(task), work),
                        Err(e) => self.settle(graph, &mut state, &mut in_flight, task, Err(e)),
                    }
                }
                Event::Attempted { id, outcome } => {
                    let Some(task) = graph.get(&id) else {
                        continue;
                    };
                    let result = match outcome {
                        Outcome::Completed(result) => result,
                        Outcome::Poked(poke) => match sensors.get_mut(&id) {
                            Some((sensor, sensor_state)) => {
                                match sensor.evaluate(sensor_state, poke) {
                                    Ok(PokeOutcome::Satisfied) => {
                                        Ok(Task::sensor_output(sensor_state.pokes()))
                                    }
                                    Ok(PokeOutcome::Reschedule(delay)) => {
                                        Self::schedule(&mut in_flight, id, delay, false);
                                        continue;
                                    }
                                    Err(e) => Err(e),
                                }
                            }
                            None => Err(FlowError::TaskExecution(format!(
                                "no sensor state for {}",
                                id
                            ))),
                        },
                        Outcome::Paged(page) => match pages.get_mut(&id) {
                            Some((caller, progress)) => {
                                let next = page.and_then(|(output, next)| {
                                    caller.record(progress, output, next);
                                    caller.next_request(progress)
                                });
                                match next {
                                    Ok(Some(request)) => {
                                        debug!(task = %id, page = progress.fetched() + 1, "next page");
                                        self.dispatch(
                                            &mut in_flight,
                                            &workers,
                                            Arc::clone(task),
                                            Work::Page(request),
                                        );
                                        continue;
                                    }
                                    Ok(None) => Ok(progress.collected()),
                                    Err(e) => Err(e),
                                }
                            }
                            None => Err(FlowError::TaskExecution(format!(
                                "no page progress for {}",
                                id
                            ))),
                        },
                    };
                    self.settle(graph, &mut state, &mut in_flight, task, result);
                }
            }
        }

        info!(
            succeeded = state.count(TaskStatus::Succeeded),
            failed = state.count(TaskStatus::Failed),
            skipped = state.count(TaskStatus::Skipped),
            "run finished"
        );

        Ok(state)
    }

    /// Work for the start of an attempt. Sensor and page progress from an
    /// earlier attempt is discarded.
    fn first_work(task: &Task, sensors: &mut Sensors, pages: &mut Pages) -> Result<Work, FlowError> {
        let id = task.id().to_string();
        match task.kind() {
            TaskKind::SingleCall => Ok(Work::Call),
            TaskKind::PollingSensor(sensor) => {
                sensors.insert(id.clone(), (*sensor, sensor.start()));
                Self::next_poke(sensors, &id)
            }
            TaskKind::PaginatedCall(caller) => {
                let progress = caller.start(task.request().clone());
                let first = caller.next_request(&progress)?;
                pages.insert(id.clone(), (*caller, progress));
                first.map(Work::Page).ok_or_else(|| {
                    FlowError::TaskExecution(format!("no first page for {}", id))
                })
            }
        }
    }

    fn next_poke(sensors: &Sensors, id: &str) -> Result<Work, FlowError> {
        match sensors.get(id) {
            Some((sensor, sensor_state)) => Ok(Work::Poke {
                deadline: sensor.deadline(sensor_state),
                timeout: sensor.timeout,
            }),
            None => Err(FlowError::TaskExecution(format!(
                "no sensor state for {}",
                id
            ))),
        }
    }

    fn settle(
        &self,
        graph: &TaskGraph,
        state: &mut RunState,
        in_flight: &mut JoinSet<Event>,
        task: &Task,
        result: Result<TaskOutput, FlowError>,
    ) {
        let id = task.id();
        let err = match result {
            Ok(output) => {
                info!(task = %id, attempts = state.attempts(id), "task succeeded");
                state.succeed(id, output);
                return;
            }
            Err(err) => err,
        };

        let attempt = state.attempts(id);
        match task.retry_policy().should_retry(attempt, &err) {
            RetryDecision::Retry { delay } => {
                warn!(task = %id, attempt, delay = ?delay, error = %err, "attempt failed, retrying");
                state.record_error(id, err);
                Self::schedule(in_flight, id.to_string(), delay, true);
            }
            RetryDecision::GiveUp => {
                error!(task = %id, attempt, error = %err, "task failed");
                state.fail(id, err);
                for downstream in graph.descendants(id) {
                    let reason = FlowError::UpstreamFailed {
                        task: downstream.to_string(),
                        upstream: id.to_string(),
                    };
                    if state.skip(downstream, reason) {
                        info!(task = %downstream, upstream = %id, "task skipped");
                    }
                }
            }
        }
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<Event>,
        workers: &Arc<Semaphore>,
        task: Arc<Task>,
        work: Work,
    ) {
        let client = Arc::clone(&self.client);
        let workers = Arc::clone(workers);

        in_flight.spawn(async move {
            let id = task.id().to_string();
            let outcome = match workers.acquire_owned().await {
                Ok(permit) => {
                    let outcome = AssertUnwindSafe(Self::attempt(&task, client.as_ref(), work))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Outcome::Completed(Err(FlowError::TaskExecution(format!(
                                "task {} panicked",
                                id
                            ))))
                        });
                    drop(permit);
                    outcome
                }
                Err(_) => Outcome::Completed(Err(FlowError::TaskExecution(
                    "worker pool closed".to_string(),
                ))),
            };
            Event::Attempted { id, outcome }
        });
    }

    async fn attempt(task: &Task, client: &dyn HttpClient, work: Work) -> Outcome {
        debug!(task = %task.id(), "running attempt");
        match work {
            Work::Call => Outcome::Completed(task.call_once(client).await),
            Work::Page(request) => Outcome::Paged(task.fetch_page(client, &request).await),
            Work::Poke {
                deadline: Some(deadline),
                timeout,
            } => Outcome::Poked(
                timeout_at(deadline, task.poke(client))
                    .await
                    .unwrap_or_else(|_| Err(FlowError::SensorTimeout(timeout))),
            ),
            Work::Poke { deadline: None, .. } => Outcome::Poked(task.poke(client).await),
        }
    }

    fn schedule(in_flight: &mut JoinSet<Event>, id: String, delay: Duration, retry: bool) {
        in_flight.spawn(async move {
            sleep(delay).await;
            Event::Due { id, retry }
        });
    }
}
