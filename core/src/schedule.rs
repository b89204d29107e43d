pub mod cron;

pub use cron::CronExpression;

use crate::errors::EverTaskError;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Near-on-time runs within this tolerance are not counted as skipped occurrences
const SKIP_TOLERANCE_MS: i64 = 1_000;

/// Safety cap for every iterative occurrence walk, schedules that cannot produce a
/// matching occurrence within this many steps fail fast instead of spinning
const WALK_CAP: usize = 10_000;

/// Upper bound on how many skipped instants are materialized into the returned list,
/// the count itself stays exact
const SKIP_LIST_CAP: usize = 1_000;

/// The base repetition of a [`RecurringSchedule`], exactly one of a fixed calendar unit
/// or a cron expression.
///
/// Seconds through weeks reduce to a fixed duration and take the constant-time
/// occurrence arithmetic, months and cron step through calendar rules instead
///
/// # See Also
/// - [`RecurringSchedule`]
/// - [`CronExpression`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurringInterval {
    /// Every `n` seconds
    Seconds(u32),
    /// Every `n` minutes
    Minutes(u32),
    /// Every `n` hours
    Hours(u32),
    /// Every `n` days
    Days(u32),
    /// Every `n` weeks
    Weeks(u32),
    /// Every `n` calendar months, day-of-month clamps to the target month's last day
    Months(u32),
    /// Occurrences described by a cron expression
    Cron(CronExpression),
}

impl RecurringInterval {
    /// The fixed duration of one step, `None` for months and cron which do not reduce
    /// to a constant delta
    pub(crate) fn fixed_delta(&self) -> Option<Duration> {
        match self {
            RecurringInterval::Seconds(n) => Some(Duration::seconds(i64::from(*n))),
            RecurringInterval::Minutes(n) => Some(Duration::minutes(i64::from(*n))),
            RecurringInterval::Hours(n) => Some(Duration::hours(i64::from(*n))),
            RecurringInterval::Days(n) => Some(Duration::days(i64::from(*n))),
            RecurringInterval::Weeks(n) => Some(Duration::weeks(i64::from(*n))),
            RecurringInterval::Months(_) | RecurringInterval::Cron(_) => None,
        }
    }

    fn unit_count(&self) -> Option<u32> {
        match self {
            RecurringInterval::Seconds(n)
            | RecurringInterval::Minutes(n)
            | RecurringInterval::Hours(n)
            | RecurringInterval::Days(n)
            | RecurringInterval::Weeks(n)
            | RecurringInterval::Months(n) => Some(*n),
            RecurringInterval::Cron(_) => None,
        }
    }
}

/// The outcome of a drift-corrected occurrence computation: the next future occurrence
/// (when the series continues), the exact number of occurrences that fell into the past
/// and were skipped, and the skipped instants themselves (materialized up to an internal
/// cap, `skipped_count` stays exact beyond it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextOccurrence {
    pub next: Option<DateTime<Utc>>,
    pub skipped_count: u64,
    pub skipped: Vec<DateTime<Utc>>,
}

impl NextOccurrence {
    fn finished() -> Self {
        Self {
            next: None,
            skipped_count: 0,
            skipped: Vec::new(),
        }
    }
}

/// [`RecurringSchedule`] is the compound description of a repeating series: one base
/// [`RecurringInterval`] narrowed by optional constraints. Constraints only ever narrow
/// the candidate set, they never relax the base interval, and every comparison is in UTC.
///
/// # Occurrence Arithmetic
/// The two operations that matter are [`RecurringSchedule::next_run`] (one step forward
/// from a given anchor) and [`RecurringSchedule::next_valid_run`] (skip past occurrences
/// that are already in the past, in constant time where the schedule reduces to a fixed
/// delta). Both anchor on the *scheduled* time of the previous run and never on the wall
/// clock, which is what keeps a series from drifting across delayed runs and downtime.
///
/// # Constraint(s)
/// - `initial_delay`, `run_now`, `specific_run_time` shape the very first run only
/// - `max_runs` and `run_until` each terminate the series, whichever triggers first wins
/// - `on_days`, `on_months`, `on_day`, `on_first` narrow the candidate dates
/// - `on_times`, `on_hour`, `on_minute`, `on_second` pin the candidate time of day
///
/// Constraint walkers validate their search space (1 to 31 for days of month, 0 to 23
/// for hours and so on) and fail fast on invalid input rather than loop unboundedly;
/// a day-of-month past the end of a month clamps to the month's last valid day.
///
/// # Example
/// ```ignore
/// use evertask::schedule::RecurringSchedule;
/// use chrono::Weekday;
///
/// // Every day at 03:30, at most 10 runs
/// let schedule = RecurringSchedule::every_days(1)
///     .at_hour(3)
///     .at_minute(30)
///     .with_max_runs(10);
///
/// // Payroll: the last-clamped 31st of every month
/// let schedule = RecurringSchedule::every_months(1).on_day_of_month(31);
///
/// // Business-hours heartbeat via cron
/// let schedule = RecurringSchedule::cron("*/5 9-17 * * MON-FRI");
/// ```
///
/// # See Also
/// - [`RecurringInterval`]
/// - [`CronExpression`]
/// - [`NextOccurrence`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    interval: RecurringInterval,
    #[serde(default)]
    initial_delay: Option<std::time::Duration>,
    #[serde(default)]
    max_runs: Option<u32>,
    #[serde(default)]
    run_until: Option<DateTime<Utc>>,
    #[serde(default)]
    run_now: bool,
    #[serde(default)]
    specific_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    on_days: Vec<Weekday>,
    #[serde(default)]
    on_months: Vec<u32>,
    #[serde(default)]
    on_times: Vec<NaiveTime>,
    #[serde(default)]
    on_hour: Option<u32>,
    #[serde(default)]
    on_minute: Option<u32>,
    #[serde(default)]
    on_second: Option<u32>,
    #[serde(default)]
    on_day: Option<u32>,
    #[serde(default)]
    on_first: Option<Weekday>,
}

impl RecurringSchedule {
    fn with_interval(interval: RecurringInterval) -> Self {
        Self {
            interval,
            initial_delay: None,
            max_runs: None,
            run_until: None,
            run_now: false,
            specific_run_time: None,
            on_days: Vec::new(),
            on_months: Vec::new(),
            on_times: Vec::new(),
            on_hour: None,
            on_minute: None,
            on_second: None,
            on_day: None,
            on_first: None,
        }
    }

    /// A series repeating every `n` seconds
    pub fn every_seconds(n: u32) -> Self {
        Self::with_interval(RecurringInterval::Seconds(n))
    }

    /// A series repeating every `n` minutes
    pub fn every_minutes(n: u32) -> Self {
        Self::with_interval(RecurringInterval::Minutes(n))
    }

    /// A series repeating every `n` hours
    pub fn every_hours(n: u32) -> Self {
        Self::with_interval(RecurringInterval::Hours(n))
    }

    /// A series repeating every `n` days
    pub fn every_days(n: u32) -> Self {
        Self::with_interval(RecurringInterval::Days(n))
    }

    /// A series repeating every `n` weeks
    pub fn every_weeks(n: u32) -> Self {
        Self::with_interval(RecurringInterval::Weeks(n))
    }

    /// A series repeating every `n` calendar months
    pub fn every_months(n: u32) -> Self {
        Self::with_interval(RecurringInterval::Months(n))
    }

    /// A series driven by a 5- or 6-field cron expression
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::with_interval(RecurringInterval::Cron(CronExpression::new(expression)))
    }

    /// Offsets the first run by `delay` from the dispatch instant, later runs are
    /// unaffected
    pub fn with_initial_delay(mut self, delay: std::time::Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Caps the series at `max_runs` completed runs across the task's whole lifetime
    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Ends the series at `until`, occurrences past it are never produced
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.run_until = Some(until);
        self
    }

    /// Runs the first occurrence immediately at dispatch
    pub fn starting_now(mut self) -> Self {
        self.run_now = true;
        self
    }

    /// Pins the first occurrence to an absolute instant
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.specific_run_time = Some(at);
        self
    }

    /// Narrows occurrences to the given weekdays
    pub fn on_days(mut self, days: impl Into<Vec<Weekday>>) -> Self {
        self.on_days = days.into();
        self
    }

    /// Narrows occurrences to the given months (1 to 12)
    pub fn on_months(mut self, months: impl Into<Vec<u32>>) -> Self {
        self.on_months = months.into();
        self
    }

    /// Pins occurrences to the given times of day, the earliest is used per date
    pub fn at_times(mut self, times: impl Into<Vec<NaiveTime>>) -> Self {
        self.on_times = times.into();
        self
    }

    /// Pins the hour of day (0 to 23)
    pub fn at_hour(mut self, hour: u32) -> Self {
        self.on_hour = Some(hour);
        self
    }

    /// Pins the minute (0 to 59)
    pub fn at_minute(mut self, minute: u32) -> Self {
        self.on_minute = Some(minute);
        self
    }

    /// Pins the second (0 to 59)
    pub fn at_second(mut self, second: u32) -> Self {
        self.on_second = Some(second);
        self
    }

    /// Pins the day of month (1 to 31), clamped to each month's last valid day
    pub fn on_day_of_month(mut self, day: u32) -> Self {
        self.on_day = Some(day);
        self
    }

    /// Narrows occurrences to the first given weekday of each month
    pub fn on_first(mut self, weekday: Weekday) -> Self {
        self.on_first = Some(weekday);
        self
    }

    /// The configured lifetime run cap, if any
    pub fn max_runs(&self) -> Option<u32> {
        self.max_runs
    }

    /// The configured series end instant, if any
    pub fn run_until(&self) -> Option<DateTime<Utc>> {
        self.run_until
    }

    /// Validates the interval and every constraint search space, failing fast on input
    /// that would otherwise send an occurrence walk into an unbounded loop
    pub fn validate(&self) -> Result<(), EverTaskError> {
        if let Some(count) = self.interval.unit_count()
            && count == 0
        {
            return Err(EverTaskError::InvalidSchedule(
                "interval count must be at least 1".into(),
            ));
        }
        if let RecurringInterval::Cron(expr) = &self.interval {
            expr.validate()?;
        }
        if let Some(day) = self.on_day
            && !(1..=31).contains(&day)
        {
            return Err(EverTaskError::InvalidSchedule(format!(
                "day of month `{day}` is outside 1..=31"
            )));
        }
        if let Some(hour) = self.on_hour
            && hour > 23
        {
            return Err(EverTaskError::InvalidSchedule(format!(
                "hour `{hour}` is outside 0..=23"
            )));
        }
        if let Some(minute) = self.on_minute
            && minute > 59
        {
            return Err(EverTaskError::InvalidSchedule(format!(
                "minute `{minute}` is outside 0..=59"
            )));
        }
        if let Some(second) = self.on_second
            && second > 59
        {
            return Err(EverTaskError::InvalidSchedule(format!(
                "second `{second}` is outside 0..=59"
            )));
        }
        if let Some(month) = self.on_months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(EverTaskError::InvalidSchedule(format!(
                "month `{month}` is outside 1..=12"
            )));
        }
        Ok(())
    }

    /// Computes the first run of a brand new series relative to `now`.
    ///
    /// Precedence: `starting_now` wins, then a pinned `specific_run_time`, then an
    /// `initial_delay` offset, and finally one plain schedule step from `now`.
    /// Returns `None` when the series can never run (`max_runs` of zero, or the
    /// first candidate already past `run_until`)
    pub fn first_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, EverTaskError> {
        if self.max_runs == Some(0) {
            return Ok(None);
        }
        let first = if self.run_now {
            now
        } else if let Some(at) = self.specific_run_time {
            at
        } else if let Some(delay) = self.initial_delay {
            now + Duration::from_std(delay).map_err(|err| {
                EverTaskError::InvalidSchedule(format!("initial delay out of range: {err}"))
            })?
        } else {
            self.next_after(now)?
        };
        if let Some(until) = self.run_until
            && first > until
        {
            return Ok(None);
        }
        Ok(Some(first))
    }

    /// One step forward from the given anchor: the next occurrence strictly after `from`,
    /// with every constraint applied. Returns `None` when `completed_runs` has reached
    /// `max_runs` or the occurrence would fall past `run_until`.
    ///
    /// This is a pure function of the schedule and `(from, completed_runs)`, the wall
    /// clock plays no part in it
    pub fn next_run(
        &self,
        from: DateTime<Utc>,
        completed_runs: u32,
    ) -> Result<Option<DateTime<Utc>>, EverTaskError> {
        if let Some(max) = self.max_runs
            && completed_runs >= max
        {
            return Ok(None);
        }
        let candidate = self.next_after(from)?;
        if let Some(until) = self.run_until
            && candidate > until
        {
            return Ok(None);
        }
        Ok(Some(candidate))
    }

    /// Skips past occurrences that already fell into the past (delayed executions,
    /// service downtime) and produces the next future occurrence while preserving the
    /// series rhythm.
    ///
    /// The anchor is `last_scheduled`, the *scheduled* instant of the previous run,
    /// never the wall clock. When the schedule reduces to a fixed delta the skip count
    /// is computed arithmetically in constant time no matter how long the downtime was:
    ///
    /// ```text
    /// skipped = max(0, ceil((now - last_scheduled - tolerance) / delta) - 1)
    /// next    = last_scheduled + (skipped + 1) * delta
    /// ```
    ///
    /// A one second tolerance keeps near-on-time runs from producing spurious skips.
    /// Schedules without a fixed delta walk occurrence by occurrence (each step itself
    /// constant-time), capped at an internal safety bound; past the bound the series
    /// re-anchors at the present, which for calendar-aligned schedules preserves the
    /// rhythm by construction
    pub fn next_valid_run(
        &self,
        last_scheduled: DateTime<Utc>,
        completed_runs: u32,
        now: DateTime<Utc>,
    ) -> Result<NextOccurrence, EverTaskError> {
        if let Some(max) = self.max_runs
            && completed_runs >= max
        {
            return Ok(NextOccurrence::finished());
        }

        if let Some(delta) = self.fixed_delta() {
            return self.next_valid_run_fixed(last_scheduled, delta, now);
        }
        self.next_valid_run_walk(last_scheduled, completed_runs, now)
    }

    /// Constant-time skip arithmetic for fixed-delta schedules
    fn next_valid_run_fixed(
        &self,
        last_scheduled: DateTime<Utc>,
        delta: Duration,
        now: DateTime<Utc>,
    ) -> Result<NextOccurrence, EverTaskError> {
        let delta_ms = delta.num_milliseconds().max(1);
        let elapsed_ms = (now - last_scheduled).num_milliseconds();

        let skipped_count = if elapsed_ms <= SKIP_TOLERANCE_MS {
            0
        } else {
            let past_ms = elapsed_ms - SKIP_TOLERANCE_MS;
            let steps = (past_ms + delta_ms - 1) / delta_ms;
            steps.saturating_sub(1).max(0) as u64
        };

        let next = last_scheduled + Duration::milliseconds(delta_ms * (skipped_count as i64 + 1));
        let mut skipped = Vec::new();
        for i in 1..=skipped_count.min(SKIP_LIST_CAP as u64) {
            skipped.push(last_scheduled + Duration::milliseconds(delta_ms * i as i64));
        }

        if let Some(until) = self.run_until
            && next > until
        {
            return Ok(NextOccurrence {
                next: None,
                skipped_count,
                skipped,
            });
        }
        Ok(NextOccurrence {
            next: Some(next),
            skipped_count,
            skipped,
        })
    }

    /// Bounded occurrence-by-occurrence walk for calendar and cron schedules
    fn next_valid_run_walk(
        &self,
        last_scheduled: DateTime<Utc>,
        completed_runs: u32,
        now: DateTime<Utc>,
    ) -> Result<NextOccurrence, EverTaskError> {
        let threshold = now - Duration::milliseconds(SKIP_TOLERANCE_MS);
        let mut anchor = last_scheduled;
        let mut skipped = Vec::new();
        let mut skipped_count: u64 = 0;

        for _ in 0..WALK_CAP {
            match self.next_run(anchor, completed_runs)? {
                None => {
                    return Ok(NextOccurrence {
                        next: None,
                        skipped_count,
                        skipped,
                    });
                }
                Some(candidate) if candidate > threshold => {
                    return Ok(NextOccurrence {
                        next: Some(candidate),
                        skipped_count,
                        skipped,
                    });
                }
                Some(candidate) => {
                    skipped_count += 1;
                    if skipped.len() < SKIP_LIST_CAP {
                        skipped.push(candidate);
                    }
                    anchor = candidate;
                }
            }
        }

        // The backlog exceeded the walk cap. Re-anchoring at the present keeps
        // calendar-aligned schedules on rhythm, the skip count is reported as truncated
        tracing::warn!(
            cap = WALK_CAP,
            "occurrence walk exceeded its safety cap, re-anchoring at the present"
        );
        let next = self.next_run(threshold, completed_runs)?;
        Ok(NextOccurrence {
            next,
            skipped_count,
            skipped,
        })
    }

    /// The fixed step duration of this schedule, `None` when the interval is calendar
    /// or cron driven or any date/time constraint narrows the series
    pub(crate) fn fixed_delta(&self) -> Option<Duration> {
        if self.has_narrowing_constraints() {
            return None;
        }
        self.interval.fixed_delta()
    }

    fn has_narrowing_constraints(&self) -> bool {
        !self.on_days.is_empty()
            || !self.on_months.is_empty()
            || !self.on_times.is_empty()
            || self.on_hour.is_some()
            || self.on_minute.is_some()
            || self.on_second.is_some()
            || self.on_day.is_some()
            || self.on_first.is_some()
    }

    /// A lower bound on the distance between consecutive occurrences, used to classify
    /// a series as frequent or infrequent. For cron this probes the gap between the
    /// next two occurrences after `from`
    pub fn minimum_interval(&self, from: DateTime<Utc>) -> Option<Duration> {
        match &self.interval {
            RecurringInterval::Cron(expr) => expr.minimum_interval(from).ok().flatten(),
            RecurringInterval::Months(n) => Some(Duration::days(28 * i64::from(*n))),
            _ => self.interval.fixed_delta(),
        }
    }

    /// The next occurrence strictly after `anchor` with all narrowing constraints
    /// applied, ignoring `max_runs` and `run_until` (the callers layer those on)
    fn next_after(&self, anchor: DateTime<Utc>) -> Result<DateTime<Utc>, EverTaskError> {
        self.validate()?;
        match &self.interval {
            RecurringInterval::Cron(expr) => {
                let mut probe = anchor;
                for _ in 0..WALK_CAP {
                    let Some(candidate) = expr.next_after(probe)? else {
                        return Err(EverTaskError::InvalidSchedule(format!(
                            "cron `{expr}` has no occurrence after {probe}"
                        )));
                    };
                    if self.matches_date_filters(candidate) && self.matches_time_filters(candidate)
                    {
                        return Ok(candidate);
                    }
                    probe = candidate;
                }
                Err(self.walk_cap_error())
            }
            _ => {
                let mut candidate = self.base_step(anchor)?;
                for _ in 0..WALK_CAP {
                    let adjusted = self.apply_pins(candidate)?;
                    if adjusted > anchor && self.matches_date_filters(adjusted) {
                        return Ok(adjusted);
                    }
                    candidate = self.base_step(candidate)?;
                }
                Err(self.walk_cap_error())
            }
        }
    }

    fn walk_cap_error(&self) -> EverTaskError {
        EverTaskError::InvalidSchedule(format!(
            "no occurrence satisfies the constraints within {WALK_CAP} steps"
        ))
    }

    /// One raw interval step with no constraints applied
    fn base_step(&self, anchor: DateTime<Utc>) -> Result<DateTime<Utc>, EverTaskError> {
        match &self.interval {
            RecurringInterval::Months(n) => anchor
                .checked_add_months(Months::new(*n))
                .ok_or_else(|| {
                    EverTaskError::InvalidSchedule("month arithmetic out of range".into())
                }),
            RecurringInterval::Cron(_) => Err(EverTaskError::InvalidSchedule(
                "cron schedules step through the cron engine".into(),
            )),
            other => {
                let delta = other
                    .fixed_delta()
                    .expect("non-cron, non-month intervals have a fixed delta");
                Ok(anchor + delta)
            }
        }
    }

    /// Snaps a stepped candidate onto the pinned day-of-month / first-weekday date and
    /// the pinned time of day
    fn apply_pins(&self, candidate: DateTime<Utc>) -> Result<DateTime<Utc>, EverTaskError> {
        let mut result = candidate;

        if let Some(day) = self.on_day {
            let clamped = day.min(last_day_of_month(result.year(), result.month()));
            result = result.with_day(clamped).ok_or_else(|| {
                EverTaskError::InvalidSchedule(format!("cannot pin day of month `{day}`"))
            })?;
        }

        if let Some(weekday) = self.on_first {
            let first = first_weekday_of_month(result.year(), result.month(), weekday);
            result = result.with_day(first).ok_or_else(|| {
                EverTaskError::InvalidSchedule("cannot pin first weekday of month".into())
            })?;
        }

        if let Some(earliest) = self.on_times.iter().min() {
            result = result
                .date_naive()
                .and_time(*earliest)
                .and_utc();
        } else {
            if let Some(hour) = self.on_hour {
                result = result.with_hour(hour).ok_or_else(|| {
                    EverTaskError::InvalidSchedule(format!("cannot pin hour `{hour}`"))
                })?;
            }
            if let Some(minute) = self.on_minute {
                result = result.with_minute(minute).ok_or_else(|| {
                    EverTaskError::InvalidSchedule(format!("cannot pin minute `{minute}`"))
                })?;
            }
            if let Some(second) = self.on_second {
                result = result.with_second(second).ok_or_else(|| {
                    EverTaskError::InvalidSchedule(format!("cannot pin second `{second}`"))
                })?;
            }
        }

        Ok(result)
    }

    fn matches_date_filters(&self, candidate: DateTime<Utc>) -> bool {
        if !self.on_days.is_empty() && !self.on_days.contains(&candidate.weekday()) {
            return false;
        }
        if !self.on_months.is_empty() && !self.on_months.contains(&candidate.month()) {
            return false;
        }
        if let Some(day) = self.on_day {
            let clamped = day.min(last_day_of_month(candidate.year(), candidate.month()));
            if candidate.day() != clamped {
                return false;
            }
        }
        if let Some(weekday) = self.on_first
            && (candidate.weekday() != weekday || candidate.day() > 7)
        {
            return false;
        }
        true
    }

    fn matches_time_filters(&self, candidate: DateTime<Utc>) -> bool {
        if !self.on_times.is_empty() && !self.on_times.contains(&candidate.time()) {
            return false;
        }
        if let Some(hour) = self.on_hour
            && candidate.hour() != hour
        {
            return false;
        }
        if let Some(minute) = self.on_minute
            && candidate.minute() != minute
        {
            return false;
        }
        if let Some(second) = self.on_second
            && candidate.second() != second
        {
            return false;
        }
        true
    }
}

/// The number of days in the given month
fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// The day of month of the first `weekday` in the given month
fn first_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| d.weekday())
        .unwrap_or(Weekday::Mon);
    1 + (weekday.num_days_from_monday() + 7 - first.num_days_from_monday()) % 7
}
