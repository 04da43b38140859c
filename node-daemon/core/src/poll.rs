use std::future::Future;
use tokio::time;

/// Why [`poll_until`] stopped without a value.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// The deadline passed before an attempt produced a value.
    Elapsed,

    /// An attempt failed with an error that should not be retried.
    Aborted(E),
}

/// Runs `attempt` immediately and then once per `interval` until it yields a
/// value, fails, or `deadline` passes.
///
/// An attempt returning `Ok(None)` is retried. Each attempt is itself bounded
/// by `deadline`, so a hung attempt cannot extend the wait.
pub async fn poll_until<T, E, F, Fut>(
    interval: time::Duration,
    deadline: time::Instant,
    mut attempt: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    // Intervals must be non-zero.
    let interval = interval.max(time::Duration::from_millis(1));
    let mut ticks = time::interval_at(time::Instant::now(), interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        if time::timeout_at(deadline, ticks.tick()).await.is_err() {
            return Err(PollError::Elapsed);
        }
        match time::timeout_at(deadline, attempt()).await {
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => {}
            Ok(Err(error)) => return Err(PollError::Aborted(error)),
            Err(_) => return Err(PollError::Elapsed),
        }
    }
}
