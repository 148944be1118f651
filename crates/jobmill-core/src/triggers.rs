//! Trigger evaluation - computing when a job next fires
//!
//! Three trigger kinds:
//! - Interval: fixed period from the reference time
//! - Cron: five-field calendar expression (minute hour day month weekday)
//! - Date: a single instant, fired exactly once
//!
//! [`compute_next`] is a pure function of `(spec, after)`; all comparisons
//! happen in UTC. Cron expressions may declare an IANA source timezone in
//! which the calendar fields are interpreted.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::SchedulerError;

/// Cron search horizon. An expression with no match within this window is
/// treated as unsatisfiable.
const HORIZON_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Trigger specification for a scheduled job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fixed-period repetition
    Interval(IntervalSchedule),
    /// Calendar expression (e.g. "30 9 * * mon-fri")
    Cron(CronSchedule),
    /// One-shot execution at a specific instant
    Date(DateSchedule),
}

impl TriggerSpec {
    /// Create an interval trigger firing every `every_secs` seconds.
    pub fn interval(every_secs: u64) -> Self {
        Self::Interval(IntervalSchedule {
            every_secs,
            until: None,
        })
    }

    /// Create a cron trigger from a five-field expression, interpreted in UTC.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron(CronSchedule {
            expression: expression.into(),
            timezone: None,
            until: None,
        })
    }

    /// Create a one-shot trigger at `at`.
    pub fn date(at: DateTime<Utc>) -> Self {
        Self::Date(DateSchedule { at })
    }
}

/// Fixed-interval schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    /// Period in seconds, must be positive
    pub every_secs: u64,
    /// No fires past this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// Calendar schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Five whitespace-separated fields: minute hour day-of-month month
    /// day-of-week. Each field is `*`, a value, a range (`1-5`), a step
    /// (`*/15`, `10-40/5`), or a comma list. Months and weekdays accept
    /// three-letter names; both `0` and `7` mean Sunday.
    pub expression: String,
    /// IANA timezone the fields are interpreted in (default UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// No fires past this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// One-shot schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateSchedule {
    /// The single firing instant (UTC)
    pub at: DateTime<Utc>,
}

/// Compute the next fire time strictly after `after`, or `None` when the
/// trigger is exhausted.
///
/// Pure: identical inputs always produce identical output. A spec that
/// fails validation (which admission should have rejected) evaluates to
/// `None` with a warning rather than panicking.
pub fn compute_next(spec: &TriggerSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match spec {
        TriggerSpec::Interval(iv) => {
            if iv.every_secs == 0 {
                warn!("interval trigger with zero period reached evaluation");
                return None;
            }
            let next = after + Duration::seconds(iv.every_secs as i64);
            match iv.until {
                Some(end) if next > end => None,
                _ => Some(next),
            }
        }
        TriggerSpec::Date(d) => {
            if d.at > after {
                Some(d.at)
            } else {
                None
            }
        }
        TriggerSpec::Cron(c) => {
            let fields = match CronFields::parse(&c.expression) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("unvalidated cron expression reached evaluation: {}", e);
                    return None;
                }
            };
            let tz = match resolve_timezone(c.timezone.as_deref()) {
                Ok(tz) => tz,
                Err(e) => {
                    warn!("unvalidated cron timezone reached evaluation: {}", e);
                    return None;
                }
            };
            let next = fields.next_after(after, tz)?;
            match c.until {
                Some(end) if next > end => None,
                _ => Some(next),
            }
        }
    }
}

/// Validate a trigger spec before it is persisted.
///
/// Rejects zero intervals, malformed cron fields, unknown timezones, and
/// calendar combinations that never match a real date (e.g. `0 0 30 2 *`).
pub fn validate(spec: &TriggerSpec) -> Result<(), SchedulerError> {
    match spec {
        TriggerSpec::Interval(iv) => {
            if iv.every_secs == 0 {
                return Err(SchedulerError::InvalidTrigger(
                    "interval period must be positive".into(),
                ));
            }
            Ok(())
        }
        TriggerSpec::Date(_) => Ok(()),
        TriggerSpec::Cron(c) => {
            let fields = CronFields::parse(&c.expression)?;
            let tz = resolve_timezone(c.timezone.as_deref())?;
            // A past `until` makes the trigger exhausted, not invalid, so
            // satisfiability is checked on the fields alone.
            if fields.next_after(Utc::now(), tz).is_none() {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "'{}' never matches a calendar date",
                    c.expression
                )));
            }
            Ok(())
        }
    }
}

/// Next fire time strictly after `now`, starting from a possibly stale
/// reference. Intervals advance in whole periods from `from` so the series
/// keeps its phase; cron and date triggers evaluate from `now` directly.
pub(crate) fn advance_past(
    spec: &TriggerSpec,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match spec {
        TriggerSpec::Interval(iv) => {
            if iv.every_secs == 0 {
                warn!("interval trigger with zero period reached evaluation");
                return None;
            }
            if from >= now {
                return compute_next(spec, from);
            }
            let every = iv.every_secs as i64;
            let behind = (now - from).num_seconds();
            let next = from + Duration::seconds((behind / every + 1) * every);
            match iv.until {
                Some(end) if next > end => None,
                _ => Some(next),
            }
        }
        _ => compute_next(spec, now.max(from)),
    }
}

fn resolve_timezone(name: Option<&str>) -> Result<Tz, SchedulerError> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| SchedulerError::InvalidTrigger(format!("unknown timezone '{name}'"))),
    }
}

/// Parsed cron fields. Wildcards materialize as the full range; the
/// `*_restricted` flags preserve whether day-of-month/day-of-week were
/// written explicitly, which drives the standard OR semantics when both are.
#[derive(Debug, Clone, PartialEq)]
struct CronFields {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>, // 0 = Sunday
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronFields {
    fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SchedulerError::InvalidTrigger(format!(
                "expected 5 cron fields (minute hour day month weekday), got {}",
                parts.len()
            )));
        }

        let (minutes, _) = parse_field(parts[0], 0, 59, &[], 0)?;
        let (hours, _) = parse_field(parts[1], 0, 23, &[], 0)?;
        let (days, dom_restricted) = parse_field(parts[2], 1, 31, &[], 0)?;
        let (months, _) = parse_field(parts[3], 1, 12, &MONTH_NAMES, 1)?;
        let (raw_dow, dow_restricted) = parse_field(parts[4], 0, 7, &DAY_NAMES, 0)?;
        // 7 is an alias for Sunday.
        let weekdays = raw_dow.into_iter().map(|d| d % 7).collect();

        Ok(Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Smallest instant strictly after `after` matching all fields,
    /// searched day-by-day in the source timezone up to the horizon.
    fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        let mut date = local.date_naive();
        let horizon = date + Duration::days(HORIZON_DAYS);
        // On the first day, candidates must be strictly later than the
        // reference minute; afterwards any matching time qualifies.
        let mut floor = Some((local.hour(), local.minute()));

        while date <= horizon {
            if self.date_matches(date) {
                while let Some((hour, minute)) = self.first_time_after(floor) {
                    let naive = date.and_hms_opt(hour, minute, 0)?;
                    // DST gaps skip the candidate; for ambiguous times the
                    // earlier offset wins.
                    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
                        let utc = dt.with_timezone(&Utc);
                        if utc > after {
                            return Some(utc);
                        }
                    }
                    floor = Some((hour, minute));
                }
            }
            date = date.succ_opt()?;
            floor = None;
        }
        None
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days.contains(&date.day());
        let dow = self
            .weekdays
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            // Standard cron: when both are explicit, either may match.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First (hour, minute) combination from the field sets, strictly after
    /// `floor` when one is given.
    fn first_time_after(&self, floor: Option<(u32, u32)>) -> Option<(u32, u32)> {
        match floor {
            None => Some((*self.hours.first()?, *self.minutes.first()?)),
            Some((fh, fm)) => {
                if self.hours.contains(&fh) {
                    if let Some(&m) = self.minutes.range(fm + 1..).next() {
                        return Some((fh, m));
                    }
                }
                let h = *self.hours.range(fh + 1..).next()?;
                Some((h, *self.minutes.first()?))
            }
        }
    }
}

/// Parse one cron field into its value set. Returns the set and whether the
/// field was restricted (anything other than a bare `*`).
fn parse_field(
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<(BTreeSet<u32>, bool), SchedulerError> {
    if text == "*" {
        return Ok(((min..=max).collect(), false));
    }

    let mut set = BTreeSet::new();
    for part in text.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    SchedulerError::InvalidTrigger(format!("bad step in cron field '{part}'"))
                })?;
                if step == 0 {
                    return Err(SchedulerError::InvalidTrigger(format!(
                        "zero step in cron field '{part}'"
                    )));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (
                parse_value(a, names, name_base)?,
                parse_value(b, names, name_base)?,
            )
        } else {
            let v = parse_value(range_part, names, name_base)?;
            (v, v)
        };

        if lo > hi {
            return Err(SchedulerError::InvalidTrigger(format!(
                "inverted range in cron field '{part}'"
            )));
        }
        if lo < min || hi > max {
            return Err(SchedulerError::InvalidTrigger(format!(
                "cron field '{part}' outside {min}-{max}"
            )));
        }
        set.extend((lo..=hi).step_by(step as usize));
    }

    if set.is_empty() {
        return Err(SchedulerError::InvalidTrigger(
            "empty cron field".to_string(),
        ));
    }
    Ok((set, true))
}

fn parse_value(text: &str, names: &[&str], name_base: u32) -> Result<u32, SchedulerError> {
    if let Some(idx) = names.iter().position(|n| text.eq_ignore_ascii_case(n)) {
        return Ok(name_base + idx as u32);
    }
    text.parse()
        .map_err(|_| SchedulerError::InvalidTrigger(format!("bad cron value '{text}'")))
}
