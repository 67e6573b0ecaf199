//! Pool controller - a single task that owns all pool state.
//!
//! Consumers hold a cloneable [`CaptchaPool`] handle that talks to the
//! controller over a channel. Generation tasks report back over a second
//! channel. The controller's select loop handles one event at a time, in this
//! priority order:
//!
//! 1. Settlements (finished generation tasks)
//! 2. Commands from handles (`begin`, `stop`, `pop`, `stats`)
//! 3. Ticker: launch tasks until in-flight plus ready reaches capacity
//! 4. Regulator: cut capacity back when ready artifacts sit unused
//!
//! Settlements go first so a finished artifact is routed before new demand is
//! looked at.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::{MIN_CHECK_INTERVAL, PoolConfig};
use crate::generator::Generator;
use crate::launcher::{InProcessLauncher, Launcher, ProcessLauncher, Settlement, spawn_task};
use crate::state::{Delivery, PoolState, PoolStats, PopOutcome, Waiter};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool controller has shut down")]
    Closed,
}

enum Command<A> {
    Begin,
    Stop,
    Pop(Waiter<A>),
    Stats(oneshot::Sender<PoolStats>),
}

/// Handle to a running pool.
///
/// Cloning is cheap; all clones drive the same controller. The controller
/// exits once every handle is dropped.
pub struct CaptchaPool<A> {
    tx: mpsc::Sender<Command<A>>,
}

impl<A> Clone for CaptchaPool<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A> CaptchaPool<A>
where
    A: DeserializeOwned + Send + 'static,
{
    /// Build a pool around `generator`.
    ///
    /// With `config.forks` set, every task runs in a worker process that
    /// re-executes the current binary (see [`crate::worker`]); the host binary
    /// must serve the same generator there. Otherwise `generator` runs on
    /// tokio tasks in this process.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<G>(config: PoolConfig, generator: G) -> Self
    where
        G: Generator<Artifact = A>,
    {
        let launcher: Arc<dyn Launcher<A>> = if config.forks {
            tracing::warn!(
                "Isolated workers enabled: generator is unused here, workers must call run_worker"
            );
            Arc::new(ProcessLauncher::current_exe().with_timeout(config.worker_timeout))
        } else {
            Arc::new(InProcessLauncher::new(generator))
        };
        Self::with_launcher(config, launcher)
    }
}

impl<A: Send + 'static> CaptchaPool<A> {
    /// Build a pool around any launcher backend. `config.forks` is ignored.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_launcher(config: PoolConfig, launcher: Arc<dyn Launcher<A>>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let controller = Controller::new(&config, launcher, rx);
        tokio::spawn(controller.run());
        Self { tx }
    }

    /// Start the ticker and, when configured, the regulator. Idempotent.
    pub async fn begin(&self) -> Result<(), PoolError> {
        self.send(Command::Begin).await
    }

    /// Stop launching new tasks. Tasks in flight still deliver; queued
    /// `pop` calls keep waiting.
    pub async fn stop(&self) -> Result<(), PoolError> {
        self.send(Command::Stop).await
    }

    /// Take the oldest ready artifact, waiting for one if none is ready.
    ///
    /// There is no built-in timeout. Dropping the returned future gives up
    /// the place in line without losing an artifact.
    pub async fn pop(&self) -> Result<A, PoolError> {
        let (waiter, artifact) = oneshot::channel();
        self.send(Command::Pop(waiter)).await?;
        artifact.await.map_err(|_| PoolError::Closed)
    }

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        let (reply, stats) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        stats.await.map_err(|_| PoolError::Closed)
    }

    async fn send(&self, command: Command<A>) -> Result<(), PoolError> {
        self.tx.send(command).await.map_err(|_| PoolError::Closed)
    }
}

enum Event<A> {
    Settled(Settlement<A>),
    Command(Command<A>),
    Tick,
    Cutback,
}

struct Controller<A> {
    state: PoolState<A>,
    launcher: Arc<dyn Launcher<A>>,
    commands: mpsc::Receiver<Command<A>>,
    done_tx: mpsc::UnboundedSender<Settlement<A>>,
    done_rx: mpsc::UnboundedReceiver<Settlement<A>>,
    check_interval: Duration,
    cutback_period: Option<Duration>,
    ticker: Option<Interval>,
    regulator: Option<Interval>,
}

impl<A: Send + 'static> Controller<A> {
    fn new(
        config: &PoolConfig,
        launcher: Arc<dyn Launcher<A>>,
        commands: mpsc::Receiver<Command<A>>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            state: PoolState::new(
                config.initial_capacity,
                config.capacity_dynamic,
                config.capacity_cutback_min_ratio,
            ),
            launcher,
            commands,
            done_tx,
            done_rx,
            check_interval: config.check_interval.max(MIN_CHECK_INTERVAL),
            cutback_period: config.cutback_period(),
            ticker: None,
            regulator: None,
        }
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;

                Some(settlement) = self.done_rx.recv() => Event::Settled(settlement),

                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => break,
                },

                _ = next_tick(&mut self.ticker) => Event::Tick,

                _ = next_tick(&mut self.regulator) => Event::Cutback,
            };

            match event {
                Event::Settled(settlement) => self.settle(settlement),
                Event::Command(Command::Begin) => self.begin(),
                Event::Command(Command::Stop) => self.stop(),
                Event::Command(Command::Pop(waiter)) => self.pop(waiter),
                Event::Command(Command::Stats(reply)) => {
                    let _ = reply.send(self.state.stats());
                }
                Event::Tick => self.tick(),
                Event::Cutback => self.cut_back(),
            }
        }

        tracing::debug!(
            pending = self.state.pending(),
            "All pool handles dropped, controller exiting"
        );
    }

    fn begin(&mut self) {
        if self.state.is_terminated() {
            tracing::warn!("Pool already stopped, ignoring begin");
            return;
        }
        if self.ticker.is_some() {
            tracing::debug!("Pool already running");
            return;
        }

        // First tick is immediate so the pool warms up on begin.
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        if let Some(period) = self.cutback_period {
            let mut regulator = tokio::time::interval_at(Instant::now() + period, period);
            regulator.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.regulator = Some(regulator);
        }

        tracing::info!(
            capacity = self.state.capacity(),
            check_interval_ms = self.check_interval.as_millis() as u64,
            regulator = self.regulator.is_some(),
            "Pool started"
        );
    }

    fn stop(&mut self) {
        if !self.state.terminate() {
            tracing::debug!("Pool already stopped");
            return;
        }
        self.ticker = None;
        self.regulator = None;
        tracing::info!(
            pending = self.state.pending(),
            ready = self.state.ready_len(),
            "Pool stopped"
        );
    }

    fn pop(&mut self, waiter: Waiter<A>) {
        let outcome = self.state.pop(waiter);
        match outcome {
            PopOutcome::Served => {}
            PopOutcome::Queued => tracing::trace!("No artifact ready, caller queued"),
            PopOutcome::Abandoned => tracing::debug!("Caller left before it was served"),
        }
    }

    fn tick(&mut self) {
        if self.state.is_terminated() {
            return;
        }
        let deficit = self.state.deficit();
        if deficit > 0 {
            tracing::debug!(
                deficit,
                capacity = self.state.capacity(),
                pending = self.state.pending(),
                ready = self.state.ready_len(),
                "Launching generation tasks"
            );
        }
        while self.state.deficit() > 0 {
            let job = self.state.reserve_launch();
            tracing::trace!(%job, "Task launched");
            spawn_task(Arc::clone(&self.launcher), job, self.done_tx.clone());
        }
    }

    fn cut_back(&mut self) {
        if let Some(capacity) = self.state.cut_back() {
            tracing::debug!(
                capacity,
                ready = self.state.ready_len(),
                "Capacity cut back"
            );
        }
    }

    fn settle(&mut self, settlement: Settlement<A>) {
        let Settlement { job, result } = settlement;
        match result {
            Ok(artifact) => match self.state.on_success(artifact) {
                Delivery::Waiter => tracing::trace!(%job, "Artifact handed to waiting caller"),
                Delivery::Ready => tracing::trace!(
                    %job,
                    ready = self.state.ready_len(),
                    "Artifact queued"
                ),
            },
            Err(e) => {
                self.state.on_failure();
                tracing::warn!(%job, error = %e, "Generation task failed");
            }
        }
    }
}

/// Next tick of `interval`, or never when it is not running.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::JobId;
    use crate::generator::GenerateError;
    use crate::launcher::LaunchError;
    use crate::state::CAPACITY_FLOOR;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TICK: Duration = Duration::from_millis(20);

    struct Counter {
        next: AtomicU32,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                next: AtomicU32::new(1),
            }
        }
    }

    #[async_trait::async_trait]
    impl Generator for Counter {
        type Artifact = u32;

        async fn create(&self) -> Result<u32, GenerateError> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    /// Each launch blocks until the test sends its artifact through the gate.
    struct Gated {
        gates: mpsc::UnboundedSender<oneshot::Sender<u32>>,
    }

    #[async_trait::async_trait]
    impl Launcher<u32> for Gated {
        async fn launch(&self, _job: JobId) -> Result<u32, LaunchError> {
            let (gate, artifact) = oneshot::channel();
            self.gates
                .send(gate)
                .map_err(|_| LaunchError::Worker("test finished".to_string()))?;
            artifact
                .await
                .map_err(|_| LaunchError::Worker("gate dropped".to_string()))
        }
    }

    /// Fails on the first call, succeeds afterwards.
    struct FailsOnce {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Launcher<u32> for FailsOnce {
        async fn launch(&self, _job: JobId) -> Result<u32, LaunchError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(GenerateError::new("renderer not ready").into()),
                n => Ok(n),
            }
        }
    }

    struct Panics;

    #[async_trait::async_trait]
    impl Launcher<u32> for Panics {
        async fn launch(&self, _job: JobId) -> Result<u32, LaunchError> {
            panic!("canvas allocation failed");
        }
    }

    fn config(capacity: usize) -> PoolConfig {
        PoolConfig::new()
            .with_initial_capacity(capacity)
            .with_check_interval(TICK)
            .with_capacity_dynamic(false)
            .with_forks(false)
    }

    type Gates = mpsc::UnboundedReceiver<oneshot::Sender<u32>>;

    fn gated(config: PoolConfig) -> (CaptchaPool<u32>, Gates) {
        let (gates, gates_rx) = mpsc::unbounded_channel();
        let pool = CaptchaPool::<u32>::with_launcher(config, Arc::new(Gated { gates }));
        (pool, gates_rx)
    }

    async fn next_gate(gates: &mut Gates) -> oneshot::Sender<u32> {
        tokio::time::timeout(Duration::from_secs(2), gates.recv())
            .await
            .expect("no task launched")
            .expect("launcher dropped")
    }

    /// Poll stats until `done` holds.
    async fn wait_for<A, F>(pool: &CaptchaPool<A>, done: F) -> PoolStats
    where
        A: Send + 'static,
        F: Fn(&PoolStats) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let stats = pool.stats().await.unwrap();
                if done(&stats) {
                    return stats;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool never reached expected state")
    }

    #[tokio::test]
    async fn nothing_launches_before_begin() {
        let pool = CaptchaPool::new(config(3), Counter::new());
        tokio::time::sleep(TICK * 3).await;

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.launched, 0);
        assert_eq!(stats.capacity, 3);
    }

    #[tokio::test]
    async fn single_capacity_fills_once() {
        let pool = CaptchaPool::new(config(1), Counter::new());
        pool.begin().await.unwrap();

        let stats = wait_for(&pool, |s| s.ready == 1 && s.pending == 0).await;
        assert_eq!(stats.launched, 1);

        tokio::time::sleep(TICK * 5).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.launched, 1);
        assert_eq!(stats.ready, 1);
    }

    #[tokio::test]
    async fn waiters_follow_completion_order() {
        let (pool, mut gates) = gated(config(2));
        pool.begin().await.unwrap();

        let first_gate = next_gate(&mut gates).await;
        let second_gate = next_gate(&mut gates).await;

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pop().await }
        });
        wait_for(&pool, |s| s.waiting == 1).await;

        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.pop().await }
        });
        wait_for(&pool, |s| s.waiting == 2).await;

        // Complete in reverse launch order.
        second_gate.send(20).unwrap();
        wait_for(&pool, |s| s.waiting == 1).await;
        first_gate.send(10).unwrap();

        assert_eq!(first.await.unwrap().unwrap(), 20);
        assert_eq!(second.await.unwrap().unwrap(), 10);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_task_deliver() {
        let (pool, mut gates) = gated(config(1));
        pool.begin().await.unwrap();

        let gate = next_gate(&mut gates).await;
        pool.stop().await.unwrap();
        gate.send(7).unwrap();

        let stats = wait_for(&pool, |s| s.ready == 1 && s.pending == 0).await;
        assert!(stats.terminated);

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(pool.stats().await.unwrap().launched, 1);
        assert!(gates.try_recv().is_err());

        // Ready artifacts are still handed out after stop.
        assert_eq!(pool.pop().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn begin_after_stop_is_ignored() {
        let pool = CaptchaPool::new(config(2), Counter::new());
        pool.stop().await.unwrap();
        pool.begin().await.unwrap();
        tokio::time::sleep(TICK * 3).await;

        let stats = pool.stats().await.unwrap();
        assert!(stats.terminated);
        assert_eq!(stats.launched, 0);
    }

    #[tokio::test]
    async fn begin_twice_is_harmless() {
        let pool = CaptchaPool::new(config(2), Counter::new());
        pool.begin().await.unwrap();
        pool.begin().await.unwrap();

        let stats = wait_for(&pool, |s| s.ready == 2).await;
        assert_eq!(stats.launched, 2);
    }

    #[tokio::test]
    async fn failed_task_is_replaced_on_next_tick() {
        let launcher = Arc::new(FailsOnce {
            calls: AtomicU32::new(0),
        });
        let pool = CaptchaPool::<u32>::with_launcher(config(1), launcher);
        pool.begin().await.unwrap();

        let artifact = tokio::time::timeout(Duration::from_secs(2), pool.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact, 1);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn panicking_task_releases_pending() {
        let pool = CaptchaPool::<u32>::with_launcher(config(1), Arc::new(Panics));
        pool.begin().await.unwrap();

        let stats = wait_for(&pool, |s| s.failed >= 2).await;
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.launched, stats.failed + stats.pending as u64);
        assert!(stats.pending <= stats.capacity);
    }

    #[tokio::test(start_paused = true)]
    async fn regulator_runs_on_floored_period_until_stop() {
        let config = config(4)
            .with_capacity_dynamic(true)
            .with_capacity_cutback_interval(Duration::from_secs(1));
        let pool = CaptchaPool::new(config, Counter::new());
        pool.begin().await.unwrap();
        wait_for(&pool, |s| s.ready == 4).await;

        // A 1s interval is floored to 10s, and the first pass comes one
        // period after begin.
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(pool.stats().await.unwrap().capacity, 4);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.ready, 4);

        // 4 ready of 3 would cut again on the next pass; stop cancels it.
        pool.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(pool.stats().await.unwrap().capacity, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn regulator_keeps_capacity_floor() {
        let config = config(3)
            .with_capacity_dynamic(true)
            .with_capacity_cutback_interval(Duration::from_secs(10));
        let pool = CaptchaPool::new(config, Counter::new());
        pool.begin().await.unwrap();
        wait_for(&pool, |s| s.ready == 3).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.capacity, CAPACITY_FLOOR);
        assert_eq!(stats.launched, 3);
    }

    #[tokio::test]
    async fn pop_raises_capacity_when_dynamic() {
        let config = config(1)
            .with_capacity_dynamic(true)
            .with_check_interval(Duration::from_secs(3600));
        let pool = CaptchaPool::new(config, Counter::new());
        pool.begin().await.unwrap();
        wait_for(&pool, |s| s.ready == 1).await;

        assert_eq!(pool.pop().await.unwrap(), 1);

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn dropped_pop_does_not_lose_artifact() {
        let (pool, mut gates) = gated(config(1));
        pool.begin().await.unwrap();
        let gate = next_gate(&mut gates).await;

        let gave_up = tokio::time::timeout(Duration::from_millis(30), pool.pop()).await;
        assert!(gave_up.is_err());

        gate.send(5).unwrap();
        let stats = wait_for(&pool, |s| s.ready == 1).await;
        assert_eq!(stats.abandoned, 1);
        assert_eq!(pool.pop().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn clones_share_one_controller() {
        let pool = CaptchaPool::new(config(1), Counter::new());
        let other = pool.clone();
        pool.begin().await.unwrap();

        wait_for(&other, |s| s.ready == 1).await;
        assert_eq!(other.pop().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_controller_reports_error() {
        let (tx, rx) = mpsc::channel::<Command<u32>>(1);
        drop(rx);
        let pool = CaptchaPool { tx };

        assert!(matches!(pool.pop().await, Err(PoolError::Closed)));
        assert!(matches!(pool.begin().await, Err(PoolError::Closed)));
        assert_eq!(PoolError::Closed.to_string(), "pool controller has shut down");
    }
}
