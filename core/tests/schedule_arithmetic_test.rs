use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use evertask::errors::EverTaskError;
use evertask::schedule::RecurringSchedule;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid instant")
}

#[test]
fn next_run_is_a_pure_function_of_its_inputs() {
    let schedule = RecurringSchedule::every_seconds(5);
    let anchor = at(1_000);
    let first = schedule.next_run(anchor, 3).expect("computes");
    let second = schedule.next_run(anchor, 3).expect("computes");
    assert_eq!(first, second);
    assert_eq!(first, Some(at(1_005)));
}

#[test]
fn next_run_steps_exactly_one_interval_from_the_anchor() {
    let schedule = RecurringSchedule::every_seconds(5);
    // The run counter must not multiply into the step
    for runs in [0, 1, 7, 100] {
        let next = schedule.next_run(at(1_000), runs).expect("computes");
        assert_eq!(next, Some(at(1_005)), "runs = {runs}");
    }
}

#[test]
fn next_run_stops_at_max_runs() {
    let schedule = RecurringSchedule::every_seconds(5).with_max_runs(3);
    assert_eq!(schedule.next_run(at(0), 2).expect("computes"), Some(at(5)));
    assert_eq!(schedule.next_run(at(0), 3).expect("computes"), None);
    assert_eq!(schedule.next_run(at(0), 10).expect("computes"), None);
}

#[test]
fn next_run_stops_past_run_until() {
    let schedule = RecurringSchedule::every_seconds(10).until(at(25));
    assert_eq!(schedule.next_run(at(10), 1).expect("computes"), Some(at(20)));
    assert_eq!(schedule.next_run(at(20), 2).expect("computes"), None);
}

#[test]
fn next_valid_run_anchors_on_the_scheduled_time_not_now() {
    let schedule = RecurringSchedule::every_seconds(5);
    // Last run was scheduled at t=0, the clock now reads t=13
    let occurrence = schedule.next_valid_run(at(0), 1, at(13)).expect("computes");
    // Occurrences at 5 and 10 fell into the past, rhythm resumes at 15 and not at 13
    assert_eq!(occurrence.next, Some(at(15)));
    assert_eq!(occurrence.skipped_count, 2);
    assert_eq!(occurrence.skipped, vec![at(5), at(10)]);
}

#[test]
fn next_valid_run_on_time_produces_no_skips() {
    let schedule = RecurringSchedule::every_seconds(5);
    let occurrence = schedule.next_valid_run(at(100), 1, at(100)).expect("computes");
    assert_eq!(occurrence.next, Some(at(105)));
    assert_eq!(occurrence.skipped_count, 0);
    assert!(occurrence.skipped.is_empty());
}

#[test]
fn next_valid_run_tolerates_near_on_time_runs() {
    let schedule = RecurringSchedule::every_seconds(5);
    // Half a second late is within the tolerance, no spurious skip
    let now = at(100) + Duration::milliseconds(500);
    let occurrence = schedule.next_valid_run(at(100), 1, now).expect("computes");
    assert_eq!(occurrence.skipped_count, 0);
    assert_eq!(occurrence.next, Some(at(105)));
}

#[test]
fn next_valid_run_skip_count_matches_the_interval_arithmetic() {
    let schedule = RecurringSchedule::every_seconds(5);
    // last + k * delta < now <= last + (k + 1) * delta with k = 2
    let occurrence = schedule.next_valid_run(at(0), 1, at(12)).expect("computes");
    assert_eq!(occurrence.next, Some(at(15)));
    assert_eq!(occurrence.skipped_count, 2);

    // Downtime of a year against a 1 second interval stays O(1) and exact. The
    // occurrence one tolerance-width before now fires immediately, everything
    // earlier is skipped
    let schedule = RecurringSchedule::every_seconds(1);
    let year = 365 * 24 * 3600;
    let occurrence = schedule.next_valid_run(at(0), 1, at(year)).expect("computes");
    assert_eq!(occurrence.skipped_count, (year - 2) as u64);
    assert_eq!(occurrence.next, Some(at(year - 1)));
}

#[test]
fn next_valid_run_respects_run_until_after_downtime() {
    let schedule = RecurringSchedule::every_seconds(5).until(at(12));
    let occurrence = schedule.next_valid_run(at(0), 1, at(20)).expect("computes");
    // The next on-rhythm occurrence (t=25 after skipping) is past the horizon
    assert_eq!(occurrence.next, None);
}

#[test]
fn first_run_precedence() {
    let now = at(1_000);

    let schedule = RecurringSchedule::every_minutes(10).starting_now();
    assert_eq!(schedule.first_run(now).expect("computes"), Some(now));

    let schedule = RecurringSchedule::every_minutes(10).starting_at(at(5_000));
    assert_eq!(schedule.first_run(now).expect("computes"), Some(at(5_000)));

    let schedule = RecurringSchedule::every_minutes(10)
        .with_initial_delay(std::time::Duration::from_secs(30));
    assert_eq!(schedule.first_run(now).expect("computes"), Some(at(1_030)));

    // No first-run shaping: one plain interval step
    let schedule = RecurringSchedule::every_minutes(10);
    assert_eq!(schedule.first_run(now).expect("computes"), Some(at(1_600)));

    // A cap of zero runs means the series never starts
    let schedule = RecurringSchedule::every_minutes(10).with_max_runs(0);
    assert_eq!(schedule.first_run(now).expect("computes"), None);
}

#[test]
fn monthly_on_day_31_clamps_to_the_last_valid_day() {
    let schedule = RecurringSchedule::every_months(1).on_day_of_month(31);
    let jan = Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).single().expect("valid");

    let feb = schedule.next_run(jan, 1).expect("computes").expect("occurs");
    assert_eq!((feb.year(), feb.month(), feb.day()), (2025, 2, 28));

    let mar = schedule.next_run(feb, 2).expect("computes").expect("occurs");
    assert_eq!((mar.year(), mar.month(), mar.day()), (2025, 3, 31));
}

#[test]
fn daily_at_pinned_hour() {
    let schedule = RecurringSchedule::every_days(1).at_hour(3).at_minute(30).at_second(0);
    let anchor = Utc.with_ymd_and_hms(2025, 6, 1, 15, 45, 12).single().expect("valid");
    let next = schedule.next_run(anchor, 0).expect("computes").expect("occurs");
    assert_eq!((next.day(), next.hour(), next.minute(), next.second()), (2, 3, 30, 0));
}

#[test]
fn weekly_narrowed_to_weekdays() {
    let schedule = RecurringSchedule::every_days(1).on_days(vec![Weekday::Mon, Weekday::Wed]);
    // 2025-06-01 is a Sunday
    let sunday = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).single().expect("valid");
    let next = schedule.next_run(sunday, 0).expect("computes").expect("occurs");
    assert_eq!(next.weekday(), Weekday::Mon);
    assert_eq!(next.day(), 2);

    let after = schedule.next_run(next, 1).expect("computes").expect("occurs");
    assert_eq!(after.weekday(), Weekday::Wed);
    assert_eq!(after.day(), 4);
}

#[test]
fn monthly_on_first_weekday() {
    let schedule = RecurringSchedule::every_months(1).on_first(Weekday::Tue);
    let anchor = Utc.with_ymd_and_hms(2025, 5, 20, 12, 0, 0).single().expect("valid");
    let next = schedule.next_run(anchor, 0).expect("computes").expect("occurs");
    // First Tuesday of June 2025 is the 3rd
    assert_eq!((next.month(), next.day()), (6, 3));
    assert_eq!(next.weekday(), Weekday::Tue);
}

#[test]
fn cron_five_field_expressions_are_accepted() {
    let schedule = RecurringSchedule::cron("*/5 * * * *");
    let anchor = Utc.with_ymd_and_hms(2025, 6, 1, 10, 2, 17).single().expect("valid");
    let next = schedule.next_run(anchor, 0).expect("computes").expect("occurs");
    assert_eq!((next.minute(), next.second()), (5, 0));
}

#[test]
fn cron_six_field_expressions_keep_their_seconds() {
    let schedule = RecurringSchedule::cron("*/30 * * * * *");
    let anchor = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 10).single().expect("valid");
    let next = schedule.next_run(anchor, 0).expect("computes").expect("occurs");
    assert_eq!(next.second(), 30);
}

#[test]
fn cron_rhythm_survives_downtime() {
    // Every five minutes, with the service gone for a day
    let schedule = RecurringSchedule::cron("*/5 * * * *");
    let last = Utc.with_ymd_and_hms(2025, 6, 1, 10, 5, 0).single().expect("valid");
    let now = Utc.with_ymd_and_hms(2025, 6, 2, 10, 3, 10).single().expect("valid");
    let occurrence = schedule.next_valid_run(last, 12, now).expect("computes");
    let next = occurrence.next.expect("series continues");
    // The next fire stays aligned to the five-minute grid
    assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));
    assert_eq!(next.day(), 2);
    assert!(occurrence.skipped_count > 200);
}

#[test]
fn cron_minimum_interval_probe() {
    let schedule = RecurringSchedule::cron("*/5 * * * *");
    let gap = schedule
        .minimum_interval(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().expect("valid"))
        .expect("probe");
    assert_eq!(gap, Duration::minutes(5));
}

#[test]
fn invalid_inputs_fail_fast() {
    assert!(matches!(
        RecurringSchedule::every_seconds(0).validate(),
        Err(EverTaskError::InvalidSchedule(_))
    ));
    assert!(matches!(
        RecurringSchedule::every_days(1).at_hour(24).validate(),
        Err(EverTaskError::InvalidSchedule(_))
    ));
    assert!(matches!(
        RecurringSchedule::every_months(1).on_day_of_month(0).validate(),
        Err(EverTaskError::InvalidSchedule(_))
    ));
    assert!(matches!(
        RecurringSchedule::every_days(1).on_months(vec![13]).validate(),
        Err(EverTaskError::InvalidSchedule(_))
    ));
    assert!(matches!(
        RecurringSchedule::cron("not a cron").validate(),
        Err(EverTaskError::InvalidSchedule(_))
    ));
    assert!(RecurringSchedule::cron("*/5 * * * *").validate().is_ok());
}

#[test]
fn schedules_round_trip_through_serde() {
    let schedule = RecurringSchedule::cron("*/5 9-17 * * MON-FRI")
        .with_max_runs(10)
        .until(at(2_000_000_000));
    let json = serde_json::to_string(&schedule).expect("serializes");
    let back: RecurringSchedule = serde_json::from_str(&json).expect("deserializes");
    // The parse cache is rebuilt lazily on the other side
    assert_eq!(
        back.next_run(at(1_750_000_000), 0).expect("computes"),
        schedule.next_run(at(1_750_000_000), 0).expect("computes")
    );
}
