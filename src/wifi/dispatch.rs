//! Event dispatch shared by both state machines.
//!
//! A dispatcher task owns a bus subscription and applies events to its
//! machine strictly one at a time. The first terminal verdict resolves the
//! caller's oneshot; later verdicts (a reconnect after a drop, say) are only
//! logged. The task runs until cancelled or the bus closes.

use super::{Event, WifiError};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Terminal result of a flow.
pub(crate) type Verdict<T> = Result<T, WifiError>;

/// A synchronous state machine driven by bus events.
pub(crate) trait Transitions: Send + 'static {
    type Outcome: std::fmt::Debug + Send + 'static;

    /// Name used in log lines.
    const NAME: &'static str;

    /// Apply one event. Returns a verdict when a terminal state is reached.
    fn handle(&mut self, event: &Event) -> Option<Verdict<Self::Outcome>>;
}

/// Lock machine state, taking over a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running dispatcher task.
pub(crate) struct Dispatcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Dispatcher {
    /// Stop the task and wait until it has applied its last event.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("Dispatcher task panicked: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the task that feeds `events` into `machine`.
///
/// `events` must be subscribed before the machine issues its first command.
pub(crate) fn spawn_dispatcher<M: Transitions>(
    machine: Arc<Mutex<M>>,
    mut events: broadcast::Receiver<Event>,
    done: oneshot::Sender<Verdict<M::Outcome>>,
    cancel: CancellationToken,
) -> Dispatcher {
    let stop = cancel.clone();
    let task = tokio::spawn(async move {
        let mut done = Some(done);
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("{} dispatcher shutting down", M::NAME);
                    break;
                }

                result = events.recv() => match result {
                    Ok(event) => {
                        let verdict = lock(&machine).handle(&event);
                        if let Some(verdict) = verdict {
                            match done.take() {
                                Some(tx) => {
                                    let _ = tx.send(verdict);
                                }
                                None => debug!("{} after outcome: {:?}", M::NAME, verdict),
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("{} dispatcher lagged, {} events dropped", M::NAME, missed);
                    }
                    Err(RecvError::Closed) => {
                        warn!("{} event source closed", M::NAME);
                        if let Some(tx) = done.take() {
                            let _ = tx.send(Err(WifiError::EventSourceClosed));
                        }
                        break;
                    }
                },
            }
        }
    });
    Dispatcher { cancel: stop, task }
}

/// Wait for the dispatcher's verdict or cancellation.
pub(crate) async fn wait_outcome<T>(
    rx: oneshot::Receiver<Verdict<T>>,
    cancel: &CancellationToken,
) -> Verdict<T> {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(WifiError::Cancelled),
        result = rx => result.unwrap_or(Err(WifiError::EventSourceClosed)),
    }
}

/// Apply every event already queued on `events`, returning the verdicts
/// produced along the way.
#[cfg(test)]
pub(crate) fn pump<M: Transitions>(
    machine: &mut M,
    events: &mut broadcast::Receiver<Event>,
) -> Vec<Verdict<M::Outcome>> {
    let mut verdicts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Some(verdict) = machine.handle(&event) {
            verdicts.push(verdict);
        }
    }
    verdicts
}
