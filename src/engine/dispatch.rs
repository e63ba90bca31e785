use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Runs `jobs` with at most `limit` in flight.
///
/// A permit is acquired before `start` spawns each job, and the job holds it
/// until it finishes. Completed jobs are handed to `done` as they finish, on
/// the caller's task. Once `cancel` fires no further job is started; running
/// jobs are still drained. Returns the number of jobs never started.
pub(crate) async fn run_bounded<J, T, S, D>(
    jobs: Vec<J>,
    limit: usize,
    cancel: &CancellationToken,
    mut start: S,
    mut done: D,
) -> usize
where
    T: Send + 'static,
    S: FnMut(&mut JoinSet<T>, J, OwnedSemaphorePermit),
    D: FnMut(Result<T, JoinError>),
{
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut in_flight = JoinSet::new();
    let mut pending = jobs.into_iter();
    let mut next = pending.next();
    let mut undispatched = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled(), if next.is_some() => {
                undispatched = 1 + pending.len();
                next = None;
            }

            joined = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Some(joined) = joined {
                    done(joined);
                }
            }

            permit = Arc::clone(&semaphore).acquire_owned(), if next.is_some() => {
                let Ok(permit) = permit else {
                    // The semaphore is never closed while we hold it.
                    break;
                };
                if let Some(job) = next.take() {
                    start(&mut in_flight, job, permit);
                }
                next = pending.next();
            }

            else => break,
        }
    }

    undispatched
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut finished = 0;

        let undispatched = run_bounded(
            (0..20).collect(),
            3,
            &CancellationToken::new(),
            |set: &mut JoinSet<u64>, job: u64, permit| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                set.spawn(async move {
                    let _permit = permit;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2 + job % 3)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    job
                });
            },
            |joined| {
                joined.expect("task");
                finished += 1;
            },
        )
        .await;

        assert_eq!(undispatched, 0);
        assert_eq!(finished, 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch_and_drains() {
        let cancel = CancellationToken::new();
        let mut finished = 0;

        let undispatched = run_bounded(
            (0..10).collect(),
            1,
            &cancel,
            |set: &mut JoinSet<()>, _job: u32, permit| {
                let cancel = cancel.clone();
                set.spawn(async move {
                    let _permit = permit;
                    cancel.cancel();
                });
            },
            |joined| {
                joined.expect("task");
                finished += 1;
            },
        )
        .await;

        assert_eq!(finished, 1);
        assert_eq!(undispatched, 9);
    }

    #[tokio::test]
    async fn test_panicked_job_is_reported() {
        let mut errors = 0;
        let mut ok = 0;

        run_bounded(
            vec![true, false, true],
            2,
            &CancellationToken::new(),
            |set: &mut JoinSet<()>, should_panic: bool, permit| {
                set.spawn(async move {
                    let _permit = permit;
                    assert!(!should_panic, "boom");
                });
            },
            |joined| match joined {
                Ok(()) => ok += 1,
                Err(e) => {
                    assert!(e.is_panic());
                    errors += 1;
                }
            },
        )
        .await;

        assert_eq!(ok, 1);
        assert_eq!(errors, 2);
    }
}
