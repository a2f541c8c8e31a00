//! Retry-with-backoff run loop
//!
//! Every long-lived worker in the system is a `run_loop` around an attempt
//! function: the coordinator's git sync, the agent's inventory poll, node
//! registration, and the reconciler. The loop owns all retry and pacing
//! policy so the attempt functions stay straight-line code.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

const INITIAL_RETRY: Duration = Duration::from_millis(50);
const COOLDOWN: Duration = Duration::from_millis(100);

/// Drives `attempt` until the signal channel closes.
///
/// Guarantees:
/// - an initial attempt runs without waiting for a signal;
/// - each inbound signal enqueues at most one pending attempt (senders
///   should use a one-slot channel with `try_send` so bursts coalesce);
/// - with `resync` set, a jittered periodic tick also enqueues an attempt;
/// - a `false` return sleeps the current backoff (50 ms, growing by 1.125x
///   per failure, capped at `max_retry`, ±5% jitter) and retries until
///   `attempt` succeeds;
/// - after a success a jittered 100 ms cooldown elapses before the next
///   attempt, bounding the rate under back-to-back signals.
pub async fn run_loop<F, Fut>(
    mut signal: mpsc::Receiver<()>,
    resync: Option<Duration>,
    max_retry: Duration,
    mut attempt: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut pending = true;

    loop {
        if pending {
            pending = false;

            let mut last_retry = Duration::ZERO;
            loop {
                if attempt().await {
                    break;
                }

                if last_retry.is_zero() {
                    last_retry = INITIAL_RETRY;
                }
                last_retry += last_retry / 8;
                if last_retry > max_retry {
                    last_retry = max_retry;
                }

                tokio::time::sleep(jitter(last_retry)).await;
            }

            tokio::time::sleep(jitter(COOLDOWN)).await;
        }

        let tick = async {
            match resync {
                Some(period) => tokio::time::sleep(jitter(period)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            got = signal.recv() => match got {
                Some(()) => pending = true,
                None => return,
            },
            _ = tick => pending = true,
        }
    }
}

/// Returns `duration` offset by a uniformly random ±5%.
pub fn jitter(duration: Duration) -> Duration {
    let max_jitter = duration.as_nanos() as i64 * 5 / 100;
    if max_jitter == 0 {
        return duration;
    }

    let offset = rand::thread_rng().gen_range(-max_jitter..max_jitter);
    if offset < 0 {
        duration - Duration::from_nanos(offset.unsigned_abs())
    } else {
        duration + Duration::from_nanos(offset as u64)
    }
}
