//! Timer tasks behind session and server callbacks.
//!
//! Each scheduled callback is one tokio task holding a cancellation token.
//! The group never touches documents itself: it invokes a [`Runner`], which
//! reports whether a periodic callback should keep going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use docsync_core::{CallbackError, CallbackHandle, CallbackKind};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One invocation. Resolves to `false` when the callback no longer exists.
pub type Runner = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

const MIN_PERIOD: Duration = Duration::from_millis(1);

type Entries = Arc<Mutex<HashMap<CallbackHandle, (CallbackKind, CancellationToken)>>>;

/// A set of running callback tasks that can be cancelled individually or
/// all at once.
#[derive(Clone, Default)]
pub struct CallbackGroup {
    entries: Entries,
}

impl std::fmt::Debug for CallbackGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackGroup").field("len", &self.len()).finish()
    }
}

impl CallbackGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start driving `runner` according to `kind`.
    pub fn schedule(&self, handle: CallbackHandle, kind: CallbackKind, runner: Runner) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No async runtime available, callback {handle:?} will not run");
            return;
        };
        let token = CancellationToken::new();
        self.entries.lock().insert(handle, (kind, token.clone()));
        let entries = Arc::clone(&self.entries);
        runtime.spawn(async move {
            drive(kind, runner, token).await;
            entries.lock().remove(&handle);
        });
    }

    /// Stop a callback. Returns false if it was not running.
    pub fn cancel(&self, handle: CallbackHandle) -> bool {
        match self.entries.lock().remove(&handle) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop a callback, checking that it is of the expected kind.
    pub fn remove(&self, handle: CallbackHandle, expected: CallbackKind) -> Result<(), CallbackError> {
        let mut entries = self.entries.lock();
        let (kind, _) = entries.get(&handle).ok_or(CallbackError::AlreadyRemoved)?;
        if std::mem::discriminant(kind) != std::mem::discriminant(&expected) {
            return Err(CallbackError::WrongKind {
                expected: kind_label(&expected),
                actual: kind_label(kind),
            });
        }
        if let Some((_, token)) = entries.remove(&handle) {
            token.cancel();
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.entries.lock().drain() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn kind_label(kind: &CallbackKind) -> &'static str {
    match kind {
        CallbackKind::NextTick => "next tick",
        CallbackKind::Timeout(_) => "timeout",
        CallbackKind::Periodic(_) => "periodic",
    }
}

async fn drive(kind: CallbackKind, runner: Runner, token: CancellationToken) {
    match kind {
        CallbackKind::NextTick => {
            tokio::task::yield_now().await;
            if !token.is_cancelled() {
                runner().await;
            }
        }
        CallbackKind::Timeout(delay) => {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        runner().await;
                    }
                }
            }
        }
        CallbackKind::Periodic(period) => {
            let period = period.max(MIN_PERIOD);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if token.is_cancelled() || !runner().await {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>, keep_going: bool) -> Runner {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                keep_going
            })
        })
    }

    #[tokio::test]
    async fn test_next_tick_runs_once() {
        let group = CallbackGroup::new();
        let count = Arc::new(AtomicUsize::new(0));
        group.schedule(CallbackHandle::next(), CallbackKind::NextTick, counting(count.clone(), true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancelled_before_firing() {
        let group = CallbackGroup::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = CallbackHandle::next();
        group.schedule(handle, CallbackKind::Timeout(Duration::from_secs(5)), counting(count.clone(), true));
        assert!(group.cancel(handle));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!group.cancel(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_stops_when_runner_declines() {
        let group = CallbackGroup::new();
        let count = Arc::new(AtomicUsize::new(0));
        group.schedule(
            CallbackHandle::next(),
            CallbackKind::Periodic(Duration::from_millis(100)),
            counting(count.clone(), false),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_checks_kind() {
        let group = CallbackGroup::new();
        let handle = CallbackHandle::next();
        let count = Arc::new(AtomicUsize::new(0));
        group.schedule(handle, CallbackKind::Periodic(Duration::from_secs(1)), counting(count, true));
        assert!(matches!(
            group.remove(handle, CallbackKind::Timeout(Duration::ZERO)),
            Err(CallbackError::WrongKind { .. })
        ));
        assert_eq!(group.remove(handle, CallbackKind::Periodic(Duration::ZERO)), Ok(()));
        assert_eq!(
            group.remove(handle, CallbackKind::Periodic(Duration::ZERO)),
            Err(CallbackError::AlreadyRemoved)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let group = CallbackGroup::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            group.schedule(
                CallbackHandle::next(),
                CallbackKind::Periodic(Duration::from_millis(10)),
                counting(count.clone(), true),
            );
        }
        assert_eq!(group.len(), 3);
        group.cancel_all();
        assert!(group.is_empty());
        let before = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);
    }
}
