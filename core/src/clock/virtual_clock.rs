use crate::clock::{AdvanceableClock, SchedulerClock};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;

#[allow(unused_imports)]
use crate::clock::SystemClock;

/// [`VirtualClock`] is an implementation of the [`SchedulerClock`] trait, it acts as a mock
/// object, allowing to simulate time without the waiting around. This can especially be useful
/// for unit tests, downtime simulations and so on
///
/// Unlike [`SystemClock`], this clock doesn't move forward, rather it needs explicit calls to
/// advance methods ([`VirtualClock`] implements the [`AdvanceableClock`] extension trait),
/// which makes it predictable at any point throughout the program
///
/// # Constructor(s)
/// When constructing a [`VirtualClock`], one can use a variety of constructor methods, those
/// being:
/// - [`VirtualClock::new`] For creating one from an initial `DateTime<Utc>` instant
/// - [`VirtualClock::from_millis`] For creating one from a millisecond offset since the epoch
/// - [`VirtualClock::from_current_time`] For creating one based on the current time
/// - [`VirtualClock::from_epoch`] For creating one based on the UNIX Epoch
///
/// # Trait Implementation(s)
/// It is clear as day, that [`VirtualClock`] implements the [`SchedulerClock`] but it also
/// implements the [`AdvanceableClock`] extension trait and the [`Debug`] trait
///
/// # See Also
/// - [`SystemClock`]
/// - [`AdvanceableClock`]
/// - [`SchedulerClock`]
pub struct VirtualClock {
    current_millis: AtomicI64,
    notify: Notify,
}

impl Debug for VirtualClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field(
                "current_time",
                &Utc.timestamp_millis_opt(self.current_millis.load(Ordering::Relaxed))
                    .single(),
            )
            .finish()
    }
}

impl VirtualClock {
    /// Creates / Constructs a new [`VirtualClock`] instance with the
    /// time set to the supplied ``initial_time``
    pub fn new(initial_time: DateTime<Utc>) -> Self {
        VirtualClock::from_millis(initial_time.timestamp_millis())
    }

    /// Creates / Constructs a new [`VirtualClock`] instance with the time set to
    /// ``initial_millis``, represented in **total milliseconds** since the UNIX Epoch
    pub fn from_millis(initial_millis: i64) -> Self {
        VirtualClock {
            current_millis: AtomicI64::new(initial_millis),
            notify: Notify::new(),
        }
    }

    /// Creates / Constructs a new [`VirtualClock`] instance with the time
    /// set to the current time
    pub fn from_current_time() -> Self {
        Self::new(Utc::now())
    }

    /// Creates / Constructs a new [`VirtualClock`] instance with the time
    /// set to the UNIX Epoch
    pub fn from_epoch() -> Self {
        Self::from_millis(0)
    }
}

#[async_trait]
impl AdvanceableClock for VirtualClock {
    async fn advance_to(&self, to: DateTime<Utc>) {
        self.current_millis
            .store(to.timestamp_millis(), Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl SchedulerClock for VirtualClock {
    async fn now(&self) -> DateTime<Utc> {
        let now = self.current_millis.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(now)
            .single()
            .unwrap_or_else(Utc::now)
    }

    async fn idle_until(&self, to: DateTime<Utc>) {
        loop {
            // Created before the time check so an advance between the check and the
            // await still wakes this waiter
            let notified = self.notify.notified();
            if self.now().await >= to {
                return;
            }
            notified.await;
        }
    }
}
