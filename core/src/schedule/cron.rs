use crate::errors::EverTaskError;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;

#[allow(unused_imports)]
use crate::schedule::RecurringSchedule;

/// [`CronExpression`] wraps a cron string together with its parsed form. The expression is
/// parsed at most once per instance and the parsed schedule is cached for every later
/// occurrence computation, the cache lives and dies with the expression string it was
/// built from (the string is immutable after construction, a new expression means a new
/// instance and therefore a fresh cache)
///
/// # Field Count(s)
/// Both 5-field (`min hour dom month dow`) and 6-field (with a leading seconds column)
/// expressions are accepted. A 5-field expression is normalized by pinning seconds to `0`
///
/// # Example
/// ```ignore
/// use evertask::schedule::CronExpression;
///
/// // Every five minutes
/// let expr = CronExpression::new("*/5 * * * *");
///
/// // Every 30 seconds, 6-field form
/// let expr = CronExpression::new("*/30 * * * * *");
/// ```
///
/// # See Also
/// - [`RecurringSchedule`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExpression {
    expression: String,
    #[serde(skip, default)]
    cache: OnceLock<Schedule>,
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronExpression {}

impl Display for CronExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

impl CronExpression {
    /// Creates / Constructs a new [`CronExpression`] from a 5- or 6-field cron string.
    /// Parsing is deferred until the first occurrence computation, use
    /// [`CronExpression::validate`] to surface malformed input eagerly
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            cache: OnceLock::new(),
        }
    }

    /// The raw expression string as supplied by the caller
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Parses the expression (normalizing 5-field input) without touching the cache
    fn parse(expression: &str) -> Result<Schedule, EverTaskError> {
        let fields = expression.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        Schedule::from_str(&normalized).map_err(|err| {
            EverTaskError::InvalidSchedule(format!("malformed cron `{expression}`: {err}"))
        })
    }

    /// The parsed schedule, computed once and cached afterwards
    fn schedule(&self) -> Result<&Schedule, EverTaskError> {
        if let Some(parsed) = self.cache.get() {
            return Ok(parsed);
        }
        let parsed = Self::parse(&self.expression)?;
        Ok(self.cache.get_or_init(|| parsed))
    }

    /// Fails fast when the expression cannot be parsed
    pub fn validate(&self) -> Result<(), EverTaskError> {
        self.schedule().map(|_| ())
    }

    /// The first occurrence strictly after `anchor`, `None` when the expression has no
    /// future occurrences (a bounded year field that already passed)
    pub fn next_after(&self, anchor: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, EverTaskError> {
        Ok(self.schedule()?.after(&anchor).next())
    }

    /// The distance between the next two occurrences after `from`. Other components use
    /// this probe to classify a cron-driven task as frequent or infrequent
    pub fn minimum_interval(
        &self,
        from: DateTime<Utc>,
    ) -> Result<Option<Duration>, EverTaskError> {
        let mut occurrences = self.schedule()?.after(&from);
        match (occurrences.next(), occurrences.next()) {
            (Some(first), Some(second)) => Ok(Some(second - first)),
            _ => Ok(None),
        }
    }
}
