use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use balance_watch_core::now_utc;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Upper bound on a single sleep, so a stop request is noticed promptly.
const POLL_INTERVAL: Duration = Duration::seconds(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Once,
    /// Every Monday at 00:00 UTC.
    Weekly,
    Interval(Duration),
}

impl Cadence {
    #[must_use]
    pub fn every_hours(hours: u32) -> Self {
        Self::Interval(Duration::hours(i64::from(hours)))
    }

    /// First fire time strictly after `after`, or `None` for a one-shot cadence.
    #[must_use]
    pub fn next_fire_after(self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Once => None,
            Self::Weekly => Some(next_weekly_anchor(after)),
            Self::Interval(every) => Some(after + every),
        }
    }
}

impl Display for Cadence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Weekly => write!(f, "every Monday at 00:00 UTC"),
            Self::Interval(every) => write!(f, "every {} hours", every.whole_hours()),
        }
    }
}

#[must_use]
pub fn next_weekly_anchor(after: OffsetDateTime) -> OffsetDateTime {
    let after = after.to_offset(UtcOffset::UTC);
    let days_ahead = (7 - i64::from(after.weekday().number_days_from_monday())) % 7;
    let candidate = (after.date() + Duration::days(days_ahead))
        .midnight()
        .assume_utc();

    if candidate > after {
        candidate
    } else {
        candidate + Duration::weeks(1)
    }
}

/// Installs a Ctrl+C handler that clears the returned flag.
///
/// # Errors
/// Returns an error when a handler is already installed for this process.
pub fn install_stop_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("failed to install Ctrl+C handler")?;
    Ok(running)
}

/// Runs `job` on `cadence` until `running` is cleared.
///
/// A failed run is logged and the loop carries on with the next slot. When
/// runs overlap the following slot, missed slots are coalesced into one.
/// Returns the number of attempted runs.
pub fn run_schedule<F>(cadence: Cadence, immediately: bool, running: &AtomicBool, mut job: F) -> usize
where
    F: FnMut() -> Result<()>,
{
    let mut runs = 0;
    if immediately || cadence == Cadence::Once {
        attempt(&mut job);
        runs += 1;
    }

    let mut last = now_utc();
    while running.load(Ordering::SeqCst) {
        let Some(mut next) = cadence.next_fire_after(last) else {
            break;
        };
        let now = now_utc();
        if next <= now {
            log::warn!("missed snapshot slot at {next}; rescheduling");
            match cadence.next_fire_after(now) {
                Some(rescheduled) => next = rescheduled,
                None => break,
            }
        }

        log::info!("next snapshot at {next}");
        if !sleep_until(next, running) {
            break;
        }

        attempt(&mut job);
        runs += 1;
        last = next;
    }

    runs
}

fn attempt<F>(job: &mut F)
where
    F: FnMut() -> Result<()>,
{
    if let Err(err) = job() {
        log::warn!("scheduled snapshot failed: {err:#}");
    }
}

/// Returns `false` when interrupted before `deadline`.
fn sleep_until(deadline: OffsetDateTime, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }

        let remaining = deadline - now_utc();
        if remaining <= Duration::ZERO {
            return true;
        }

        let step = std::time::Duration::try_from(remaining.min(POLL_INTERVAL))
            .unwrap_or(std::time::Duration::from_secs(1));
        std::thread::sleep(step);
    }
}
