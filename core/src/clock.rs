pub mod system_clock;
pub mod virtual_clock;

use std::fmt::Debug;
use std::ops::Deref;
pub use system_clock::SystemClock;
pub use virtual_clock::VirtualClock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// [`SchedulerClock`] is a trait for implementing a custom engine clock, typical operations
/// include getting the current time and idling until a specific instant is reached.
///
/// # Required Methods
/// When implementing the [`SchedulerClock`], one must provide implementations for two methods,
/// those being [`SchedulerClock::now`] and [`SchedulerClock::idle_until`], the former is used
/// to get the current time while the latter is used to idle to a specific instant of interest,
/// both methods are used by the scheduling loop under the hood
///
/// # Trait Implementation(s)
/// Specifically, there are 2 noteworthy implementations to list, those being:
///
/// - [`VirtualClock`] used to simulate time (for unit-tests, debugging, downtime
///   simulations... etc.), it doesn't go forward without explicit advancing and implements
///   the [`AdvanceableClock`] trait as well
///
/// - [`SystemClock`] the default go-to clock, it automatically goes forward and doesn't wait
///   around, it doesn't implement the [`AdvanceableClock`] trait due to its nature
///
/// # IMPORTANT Note(s)
/// All instants are `DateTime<Utc>`. The engine performs every time comparison in UTC,
/// converting to local representations is left to the caller
///
/// # See Also
/// - [`VirtualClock`]
/// - [`SystemClock`]
/// - [`AdvanceableClock`]
#[async_trait]
pub trait SchedulerClock: Debug + Send + Sync {
    /// Gets the current time of the clock as a UTC instant
    async fn now(&self) -> DateTime<Utc>;

    /// Idle until this specified instant is reached (if it is in the past or present,
    /// it doesn't idle)
    async fn idle_until(&self, to: DateTime<Utc>);
}

#[async_trait]
impl<T> SchedulerClock for T
where
    T: Deref + Send + Sync + Debug,
    T::Target: SchedulerClock,
{
    async fn now(&self) -> DateTime<Utc> {
        self.deref().now().await
    }

    async fn idle_until(&self, to: DateTime<Utc>) {
        self.deref().idle_until(to).await
    }
}

/// [`AdvanceableClock`] is an optional extension to [`SchedulerClock`] which, as the name
/// suggests, allows for arbitrary advancement of time. Specific clocks might not support
/// arbitrary advancement (such as [`SystemClock`]), as such why it is an optional trait
///
/// # Required Methods
/// When implementing the [`AdvanceableClock`], one has to fully implement one method,
/// being [`AdvanceableClock::advance_to`] which is used for advancing the time to a
/// specific instant of interest
///
/// # See Also
/// - [`SchedulerClock`]
/// - [`VirtualClock`]
#[async_trait]
pub trait AdvanceableClock: SchedulerClock {
    /// Advance the time by a specified duration forward, this uses
    /// [`AdvanceableClock::advance_to`] under the hood
    async fn advance(&self, duration: Duration) {
        let now = self.now().await;
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.advance_to(now + delta).await
    }

    /// Advance the time to a specified desired future instant
    async fn advance_to(&self, to: DateTime<Utc>);
}

#[async_trait]
impl<T> AdvanceableClock for T
where
    T: Deref + Send + Sync + Debug,
    T::Target: AdvanceableClock,
{
    async fn advance(&self, duration: Duration) {
        self.deref().advance(duration).await
    }

    async fn advance_to(&self, to: DateTime<Utc>) {
        self.deref().advance_to(to).await
    }
}
