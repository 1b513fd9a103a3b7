//! Periodic background loop with cancellation
//!
//! Replaces self-rescheduling timers: one explicit loop per task, driven by a
//! `tokio::time::interval`, stopped through [`Shutdown`]. Because it only uses
//! tokio's clock, tests can drive it with paused virtual time.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::shutdown::Shutdown;

/// What a single tick reports back to the loop (for logging only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickOutcome {
    /// Nothing to do this round.
    #[default]
    Idle,
    /// The tick handled this many items.
    Worked(usize),
}

/// Run `tick` every `period` until `shutdown` is requested.
///
/// The first tick fires immediately. A tick that returns an error is logged and
/// the loop keeps going; a tick in progress is never interrupted by shutdown.
/// Returns the number of ticks executed.
pub async fn run_periodic<F, Fut>(
    name: &str,
    period: Duration,
    shutdown: Shutdown,
    mut tick: F,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<TickOutcome>>,
{
    // interval() panics on a zero period
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log::debug!("{name}: started, period {period:?}");
    let mut ticks = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.requested() => break,
            _ = interval.tick() => {}
        }
        ticks += 1;
        match tick().await {
            Ok(TickOutcome::Idle) => log::trace!("{name}: tick {ticks} idle"),
            Ok(TickOutcome::Worked(n)) => log::debug!("{name}: tick {ticks} handled {n}"),
            Err(e) => log::error!("{name}: tick {ticks} failed: {e:#}"),
        }
    }
    log::info!("{name}: stopped after {ticks} ticks");
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_on_virtual_clock() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_secs(60),
            shutdown.clone(),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(TickOutcome::Idle)
                }
            },
        ));

        // Ticks at t=0, 60, 120
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        shutdown.request();
        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_does_not_stop_loop() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = count.clone();
        let handle = tokio::spawn(run_periodic(
            "flaky",
            Duration::from_secs(10),
            shutdown.clone(),
            move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        anyhow::bail!("first tick fails");
                    }
                    Ok(TickOutcome::Worked(1))
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.request();
        let ticks = handle.await.unwrap();
        assert_eq!(ticks, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_already_cancelled() {
        let shutdown = Shutdown::new();
        shutdown.request();
        let ticks = run_periodic("noop", Duration::from_secs(1), shutdown, || async {
            Ok(TickOutcome::Idle)
        })
        .await;
        assert_eq!(ticks, 0);
    }
}
