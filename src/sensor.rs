use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

use crate::FlowError;

/// Poke schedule of a sensor task.
///
/// A sensor is never parked on a sleeping worker: `evaluate` decides after
/// each poke whether the sensor is satisfied, has failed, or should be
/// poked again after a delay, and the caller owns the waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSensor {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed pokes tolerated before the sensor fails. Zero
    /// behaves like one.
    pub max_failure_streak: u32,
}

impl Default for PollingSensor {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(7 * 24 * 60 * 60),
            max_failure_streak: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorState {
    started: Instant,
    pokes: u32,
    failure_streak: u32,
}

impl SensorState {
    pub fn pokes(&self) -> u32 {
        self.pokes
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    Satisfied,
    Reschedule(Duration),
}

impl PollingSensor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Default::default()
        }
    }

    pub fn with_max_failure_streak(mut self, streak: u32) -> Self {
        self.max_failure_streak = streak;
        self
    }

    /// When the sensor runs out of time, or `None` if the timeout is too
    /// large to represent.
    pub fn deadline(&self, state: &SensorState) -> Option<Instant> {
        state.started.checked_add(self.timeout)
    }

    pub fn start(&self) -> SensorState {
        SensorState {
            started: Instant::now(),
            pokes: 0,
            failure_streak: 0,
        }
    }

    pub fn evaluate(
        &self,
        state: &mut SensorState,
        poke: Result<bool, FlowError>,
    ) -> Result<PokeOutcome, FlowError> {
        state.pokes += 1;

        match poke {
            Ok(true) => return Ok(PokeOutcome::Satisfied),
            Err(e @ FlowError::SensorTimeout(_)) => return Err(e),
            Ok(false) => state.failure_streak = 0,
            Err(e) => {
                state.failure_streak += 1;
                if state.failure_streak >= self.max_failure_streak.max(1) {
                    return Err(FlowError::SensorCheck {
                        streak: state.failure_streak,
                        last: e.to_string(),
                    });
                }
                warn!(
                    poke = state.pokes,
                    streak = state.failure_streak,
                    error = %e,
                    "sensor check failed, treating as not yet satisfied"
                );
            }
        }

        if state.elapsed() >= self.timeout {
            return Err(FlowError::SensorTimeout(self.timeout));
        }

        debug!(poke = state.pokes, delay = ?self.interval, "sensor not satisfied");
        Ok(PokeOutcome::Reschedule(self.interval))
    }

    /// Pokes `check` until it reports true. Between pokes the future sleeps
    /// on the runtime timer, so other tasks keep running. A poke still
    /// pending at the deadline fails the sensor. Returns the number of pokes
    /// it took.
    pub async fn poll<F, Fut>(&self, mut check: F) -> Result<u32, FlowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, FlowError>>,
    {
        let mut state = self.start();
        loop {
            let poke = match self.deadline(&state) {
                Some(deadline) => timeout_at(deadline, check())
                    .await
                    .unwrap_or_else(|_| Err(FlowError::SensorTimeout(self.timeout))),
                None => check().await,
            };
            match self.evaluate(&mut state, poke)? {
                PokeOutcome::Satisfied => return Ok(state.pokes),
                PokeOutcome::Reschedule(delay) => sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn scripted(
        script: Vec<Result<bool, FlowError>>,
    ) -> impl FnMut() -> std::future::Ready<Result<bool, FlowError>> {
        let mut script: VecDeque<_> = script.into();
        move || std::future::ready(script.pop_front().unwrap_or(Ok(false)))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_poke() {
        let sensor = PollingSensor::new(Duration::from_secs(5), Duration::from_secs(60));
        let started = Instant::now();

        let pokes = sensor
            .poll(scripted(vec![Ok(false), Ok(false), Ok(true)]))
            .await
            .unwrap();

        assert_eq!(pokes, 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_satisfied() {
        let interval = Duration::from_secs(5);
        let sensor = PollingSensor::new(interval, interval * 2);

        let err = sensor.poll(scripted(vec![])).await.unwrap_err();

        assert_eq!(err, FlowError::SensorTimeout(interval * 2));
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_check_errors_count_as_not_yet() {
        let sensor = PollingSensor::new(Duration::from_secs(1), Duration::from_secs(60));
        let flaky = FlowError::Transport("timeout".into());

        let pokes = sensor
            .poll(scripted(vec![
                Err(flaky.clone()),
                Err(flaky.clone()),
                Ok(false),
                Err(flaky),
                Ok(true),
            ]))
            .await
            .unwrap();

        assert_eq!(pokes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn error_streak_fails_the_sensor() {
        let sensor = PollingSensor::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_max_failure_streak(2);
        let err = sensor
            .poll(scripted(vec![
                Err(FlowError::Transport("refused".into())),
                Err(FlowError::HttpStatus {
                    status: 500,
                    body: "boom".into(),
                }),
            ]))
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::SensorCheck { streak: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_poke_is_cut_off_at_the_deadline() {
        let sensor = PollingSensor::new(Duration::from_secs(5), Duration::from_secs(30));
        let started = Instant::now();

        let err = sensor
            .poll(|| async {
                sleep(Duration::from_secs(3600)).await;
                Ok(true)
            })
            .await
            .unwrap_err();

        assert_eq!(err, FlowError::SensorTimeout(Duration::from_secs(30)));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn timeout_is_never_masked_by_the_streak() {
        let sensor = PollingSensor::default().with_max_failure_streak(5);
        let mut state = sensor.start();
        let timeout = FlowError::SensorTimeout(sensor.timeout);

        assert_eq!(sensor.evaluate(&mut state, Err(timeout.clone())), Err(timeout));
        assert_eq!(state.failure_streak(), 0);
    }

    #[tokio::test]
    async fn evaluate_resets_streak_on_clean_poke() {
        let sensor = PollingSensor::default();
        let mut state = sensor.start();

        let outcome = sensor
            .evaluate(&mut state, Err(FlowError::Transport("x".into())))
            .unwrap();
        assert_eq!(outcome, PokeOutcome::Reschedule(sensor.interval));
        assert_eq!(state.failure_streak(), 1);

        sensor.evaluate(&mut state, Ok(false)).unwrap();
        assert_eq!(state.failure_streak(), 0);
        assert_eq!(state.pokes(), 2);
    }
}
