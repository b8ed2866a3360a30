//! Build progress monitoring.
//!
//! The monitor polls a [`ProgressSource`] on its own connection while the
//! build runs elsewhere, and ends when the build signals completion, the
//! optional timeout elapses, or it is cancelled.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::engine::{BuildProgress, IndexBuilder, IndexSpec, ProgressSource};
use crate::error::{BenchError, Result};
use crate::progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No total reported yet
    WaitingForStart,
    InProgress { total: u64, done: u64 },
    Done { total: u64 },
    TimedOut,
    Cancelled,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorState::Done { .. } | MonitorState::TimedOut | MonitorState::Cancelled
        )
    }

    /// Fold one poll result into the state.
    ///
    /// The displayed count never moves backwards and never exceeds the
    /// reported total.
    pub fn observe(self, progress: Option<BuildProgress>) -> Self {
        if self.is_terminal() {
            return self;
        }
        match progress {
            Some(p) if p.total_units > 0 => {
                let floor = match self {
                    MonitorState::InProgress { done, .. } => done,
                    _ => 0,
                };
                MonitorState::InProgress {
                    total: p.total_units,
                    done: p.done_units.max(floor).min(p.total_units),
                }
            }
            _ => self,
        }
    }

    /// The completion signal arrived
    pub fn complete(self) -> Self {
        match self {
            MonitorState::WaitingForStart => MonitorState::Done { total: 0 },
            MonitorState::InProgress { total, .. } => MonitorState::Done { total },
            terminal => terminal,
        }
    }
}

/// Tells the monitor the build has finished
pub struct CompletionSignal {
    tx: watch::Sender<bool>,
}

impl CompletionSignal {
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }
}

/// Stops a running monitor, and the build it watches, from another task
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct BuildMonitor<P: ProgressSource> {
    source: P,
    config: MonitorConfig,
    done_rx: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
    state: MonitorState,
}

impl<P: ProgressSource> BuildMonitor<P> {
    pub fn new(source: P, config: MonitorConfig) -> (Self, CompletionSignal, CancelHandle) {
        let cancel = CancelHandle::default();
        let (monitor, completion) = Self::with_cancel(source, config, &cancel);
        (monitor, completion, cancel)
    }

    /// Monitor that stops when `cancel` fires
    pub fn with_cancel(
        source: P,
        config: MonitorConfig,
        cancel: &CancelHandle,
    ) -> (Self, CompletionSignal) {
        let (done_tx, done_rx) = watch::channel(false);
        let monitor = Self {
            source,
            config,
            done_rx,
            cancel_tx: Arc::clone(&cancel.tx),
            state: MonitorState::WaitingForStart,
        };
        (monitor, CompletionSignal { tx: done_tx })
    }

    /// Poll until a terminal state is reached and return it
    pub async fn run(mut self) -> Result<MonitorState> {
        if self.config.poll_interval.is_zero() {
            return Err(BenchError::InvalidConfig("poll interval must be positive".into()));
        }
        let bar = progress::bar(0, "Building index", self.config.show_progress);
        let mut cancel_rx = self.cancel_tx.subscribe();
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.state.is_terminal() {
            if *self.done_rx.borrow() {
                self.state = self.state.complete();
                break;
            }
            if *cancel_rx.borrow() {
                self.state = MonitorState::Cancelled;
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.source.build_progress().await {
                        Ok(progress) => {
                            self.state = self.state.observe(progress);
                            if let MonitorState::InProgress { total, done } = self.state {
                                bar.set_length(total);
                                bar.set_position(done);
                            }
                            debug!(state = ?self.state, "polled build progress");
                        }
                        Err(e) => warn!(error = %e, "progress poll failed"),
                    }
                }
                changed = self.done_rx.changed() => {
                    // A dropped signal means the build side is gone
                    if changed.is_err() {
                        self.state = self.state.complete();
                    }
                }
                _ = cancel_rx.changed() => {}
                _ = async {
                    match deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => pending::<()>().await,
                    }
                } => {
                    self.state = MonitorState::TimedOut;
                }
            }
        }

        match self.state {
            MonitorState::Done { total } => {
                bar.set_length(total);
                bar.set_position(total);
                bar.finish_and_clear();
            }
            _ => bar.abandon(),
        }
        Ok(self.state)
    }
}

/// Run a build and its monitor together.
///
/// The completion signal is sent whether or not the build succeeds, so the
/// monitor always terminates. On timeout or when `cancel` fires the build
/// future is dropped, which tells the builder to stop, and the call returns
/// without waiting for it.
pub async fn build_and_monitor<B, P>(
    builder: &mut B,
    source: P,
    spec: &IndexSpec,
    config: MonitorConfig,
    cancel: &CancelHandle,
) -> Result<MonitorState>
where
    B: IndexBuilder,
    P: ProgressSource,
{
    info!(index = %spec.index_name, table = %spec.table, "starting index build");
    debug!(options = %spec.options(), "index options");
    let timeout = config.timeout;
    let (monitor, completion) = BuildMonitor::with_cancel(source, config, cancel);

    let build = async {
        let result = builder.build_index(spec).await;
        completion.signal();
        result
    };
    tokio::pin!(build);
    let monitoring = monitor.run();
    tokio::pin!(monitoring);

    tokio::select! {
        built = &mut build => {
            built?;
            let state = monitoring.await?;
            info!(index = %spec.index_name, "index build finished");
            Ok(state)
        }
        state = &mut monitoring => match state? {
            MonitorState::TimedOut => Err(BenchError::MonitorTimeout(timeout.unwrap_or_default())),
            MonitorState::Cancelled => Err(BenchError::Cancelled),
            finished => {
                build.await?;
                Ok(finished)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Metric;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn progress(total: u64, done: u64) -> Option<BuildProgress> {
        Some(BuildProgress {
            total_units: total,
            done_units: done,
        })
    }

    struct ScriptedSource {
        script: Vec<Option<BuildProgress>>,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProgressSource for ScriptedSource {
        async fn build_progress(&mut self) -> Result<Option<BuildProgress>> {
            let i = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.script[i.min(self.script.len() - 1)])
        }
    }

    struct SleepyBuilder {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl IndexBuilder for SleepyBuilder {
        async fn build_index(&mut self, _: &IndexSpec) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(BenchError::Index("out of memory".into()))
            } else {
                Ok(())
            }
        }
    }

    fn scripted(script: Vec<Option<BuildProgress>>) -> (ScriptedSource, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        (
            ScriptedSource {
                script,
                polls: Arc::clone(&polls),
            },
            polls,
        )
    }

    fn spec() -> IndexSpec {
        IndexSpec::internal("items", Metric::L2, vec![16])
    }

    #[test]
    fn test_display_is_monotone() {
        let mut state = MonitorState::WaitingForStart;
        state = state.observe(None);
        assert_eq!(state, MonitorState::WaitingForStart);
        state = state.observe(progress(100, 40));
        assert_eq!(state, MonitorState::InProgress { total: 100, done: 40 });
        state = state.observe(progress(100, 25));
        assert_eq!(state, MonitorState::InProgress { total: 100, done: 40 });
        state = state.observe(progress(100, 250));
        assert_eq!(state, MonitorState::InProgress { total: 100, done: 100 });
        state = state.observe(None);
        assert_eq!(state, MonitorState::InProgress { total: 100, done: 100 });
        assert_eq!(state.complete(), MonitorState::Done { total: 100 });
    }

    #[test]
    fn test_terminal_states_stick() {
        let done = MonitorState::Done { total: 5 };
        assert_eq!(done.observe(progress(10, 1)), done);
        assert_eq!(MonitorState::TimedOut.complete(), MonitorState::TimedOut);
        assert_eq!(MonitorState::WaitingForStart.complete(), MonitorState::Done { total: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_completion_ends_monitor() {
        let (source, polls) = scripted(vec![None, None, progress(100, 10), progress(100, 60)]);
        let mut builder = SleepyBuilder {
            delay: Duration::from_secs(5),
            fail: false,
        };
        let config = MonitorConfig::default().with_poll_interval(Duration::from_secs(1));

        let cancel = CancelHandle::default();
        let state = build_and_monitor(&mut builder, source, &spec(), config, &cancel)
            .await
            .unwrap();
        assert_eq!(state, MonitorState::Done { total: 100 });
        assert!(polls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_build_still_stops_monitor() {
        let (source, _) = scripted(vec![progress(10, 1)]);
        let mut builder = SleepyBuilder {
            delay: Duration::from_secs(2),
            fail: true,
        };
        let config = MonitorConfig::default();
        let cancel = CancelHandle::default();
        let result = build_and_monitor(&mut builder, source, &spec(), config, &cancel).await;
        assert!(matches!(result, Err(BenchError::Index(_))));
    }

    /// Never finishes on its own; records when its build future is dropped
    struct HangingBuilder {
        abandoned: Arc<AtomicBool>,
    }

    struct MarkOnDrop(Arc<AtomicBool>);

    impl Drop for MarkOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl IndexBuilder for HangingBuilder {
        async fn build_index(&mut self, _: &IndexSpec) -> Result<()> {
            let _mark = MarkOnDrop(Arc::clone(&self.abandoned));
            pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_build() {
        let (source, _) = scripted(vec![None]);
        let abandoned = Arc::new(AtomicBool::new(false));
        let mut builder = HangingBuilder {
            abandoned: Arc::clone(&abandoned),
        };
        let config = MonitorConfig::default().with_timeout(Some(Duration::from_secs(10)));
        let cancel = CancelHandle::default();
        let result = build_and_monitor(&mut builder, source, &spec(), config, &cancel).await;
        assert!(matches!(
            result,
            Err(BenchError::MonitorTimeout(d)) if d == Duration::from_secs(10)
        ));
        assert!(abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_handle_stops_build() {
        let (source, _) = scripted(vec![progress(10, 2)]);
        let abandoned = Arc::new(AtomicBool::new(false));
        let mut builder = HangingBuilder {
            abandoned: Arc::clone(&abandoned),
        };
        let cancel = CancelHandle::default();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let config = MonitorConfig::default();
        let result = build_and_monitor(&mut builder, source, &spec(), config, &cancel).await;
        assert!(matches!(result, Err(BenchError::Cancelled)));
        assert!(cancel.is_cancelled());
        assert!(abandoned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let (source, _) = scripted(vec![progress(10, 2)]);
        let (monitor, _completion, cancel) = BuildMonitor::new(source, MonitorConfig::default());
        let task = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), MonitorState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_before_first_total() {
        let (source, _) = scripted(vec![None]);
        let (monitor, completion, _cancel) = BuildMonitor::new(source, MonitorConfig::default());
        completion.signal();
        assert_eq!(monitor.run().await.unwrap(), MonitorState::Done { total: 0 });
    }
}
