//! Debouncing of ConfigMap change signals
//!
//! The watcher emits one signal per change event, which can arrive in bursts
//! (a `kubectl apply` of several ConfigMaps, a stream restart replaying
//! state). Reconciling on every signal would hammer the API server, so the
//! coalescer collapses all signals inside a window into a single downstream
//! tick. Signals carry no payload; only "something changed" crosses the
//! channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Collapse bursts of input signals into at most one output tick per window.
///
/// At each window boundary a tick is emitted iff at least one input arrived
/// since the previous boundary. On cancellation or input-channel closure a
/// pending signal is flushed as one final tick before the task terminates,
/// so a change observed right before shutdown is never lost.
pub async fn coalesce(
    mut input: mpsc::Receiver<()>,
    output: mpsc::Sender<()>,
    window: Duration,
    cancel: CancellationToken,
) {
    debug!(window = ?window, "debouncing reconciliation signals");
    let mut ticker = interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signalled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if signalled {
                    let _ = output.send(()).await;
                }
                debug!("coalescer terminated, cancellation requested");
                return;
            }
            _ = ticker.tick() => {
                if signalled {
                    signalled = false;
                    if output.send(()).await.is_err() {
                        debug!("coalescer terminated, output channel closed");
                        return;
                    }
                }
            }
            received = input.recv() => match received {
                Some(()) => {
                    signalled = true;
                }
                None => {
                    // flush the trailing signal so it isn't lost on close
                    if signalled {
                        let _ = output.send(()).await;
                    }
                    debug!("coalescer terminated, input channel closed");
                    return;
                }
            }
        }
    }
}
