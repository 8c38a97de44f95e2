//! Cron evaluation.
//!
//! Supports the five-field subset used by task triggers:
//! `minute hour day-of-month month day-of-week`. Each field may be `*`, a
//! comma list, a `start-end` range, a `*/step`, or a literal. Day-of-week
//! additionally accepts `?` and counts Monday as 0. Month only accepts `*`.
//!
//! `*/step` always expands over `0..24`, so it has hour granularity even in
//! the minute field (`*/15` in the minute field means minutes 0 and 15).
//! Expanded values outside the field's range are dropped, so `*/5` in
//! day-of-month means days 5, 10, 15 and 20.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};

use crate::error::{Result, SchedulerError};

/// How many months past `after` to search before giving up.
const MAX_MONTHS_AHEAD: u32 = 48;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    /// `None` when day-of-week is `?` (unconstrained).
    weekdays: Option<Vec<u32>>,
}

impl CronSchedule {
    /// Parse a five-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day, month, dow] = fields.as_slice() else {
            return Err(SchedulerError::unsupported(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        };

        // scheduling things that don't run every month is not supported
        if *month != "*" {
            return Err(SchedulerError::unsupported(
                expression,
                "month field must be '*'",
            ));
        }

        let minutes = parse_segment(expression, minute, 0..=59)?;
        let hours = parse_segment(expression, hour, 0..=23)?;
        let days = parse_segment(expression, day, 1..=31)?;
        let weekdays = if *dow == "?" {
            None
        } else {
            Some(parse_segment(expression, dow, 0..=6)?)
        };

        Ok(Self {
            expression: expression.to_string(),
            minutes,
            hours,
            days,
            weekdays,
        })
    }

    /// The expression text as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First qualifying instant strictly after `after`, with zeroed seconds.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if let Some(next) = self.first_in_month(after.year(), after.month(), Some(after)) {
            return Ok(next);
        }

        // no next time this month, take the first valid time of a later month
        let month_start = Utc
            .with_ymd_and_hms(after.year(), after.month(), 1, 0, 0, 0)
            .single()
            .ok_or_else(|| SchedulerError::unsupported(&self.expression, "invalid base month"))?;
        for offset in 1..=MAX_MONTHS_AHEAD {
            let Some(month) = month_start.checked_add_months(Months::new(offset)) else {
                break;
            };
            if let Some(next) = self.first_in_month(month.year(), month.month(), None) {
                return Ok(next);
            }
        }

        Err(SchedulerError::unsupported(
            &self.expression,
            format!("no matching time within {MAX_MONTHS_AHEAD} months"),
        ))
    }

    /// The next `count` run times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            cursor = self.next_after(cursor)?;
            times.push(cursor);
        }
        Ok(times)
    }

    fn first_in_month(
        &self,
        year: i32,
        month: u32,
        after: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        for &day in &self.days {
            for &hour in &self.hours {
                for &minute in &self.minutes {
                    // invalid calendar dates (e.g. Apr 31) are skipped
                    let Some(candidate) = Utc
                        .with_ymd_and_hms(year, month, day, hour, minute, 0)
                        .single()
                    else {
                        continue;
                    };
                    if let Some(weekdays) = &self.weekdays {
                        let weekday = candidate.weekday().num_days_from_monday();
                        if !weekdays.contains(&weekday) {
                            continue;
                        }
                    }
                    if after.is_none_or(|after| candidate > after) {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

/// Compute the next run time for `expression` strictly after `after`.
pub fn next_run_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    CronSchedule::parse(expression)?.next_after(after)
}

fn parse_segment(
    expression: &str,
    segment: &str,
    bounds: std::ops::RangeInclusive<u32>,
) -> Result<Vec<u32>> {
    let parse_int = |s: &str| -> Result<u32> {
        s.trim()
            .parse::<u32>()
            .map_err(|_| SchedulerError::unsupported(expression, format!("bad value '{s}'")))
    };

    let mut values: Vec<u32> = if segment == "*" {
        bounds.clone().collect()
    } else if segment.contains(',') {
        segment.split(',').map(parse_int).collect::<Result<Vec<_>>>()?
    } else if let Some(step) = segment.strip_prefix("*/") {
        let step = parse_int(step)?;
        if step == 0 {
            return Err(SchedulerError::unsupported(expression, "step must be positive"));
        }
        let values: Vec<u32> = (0..24)
            .step_by(step as usize)
            .filter(|v| bounds.contains(v))
            .collect();
        if values.is_empty() {
            return Err(SchedulerError::unsupported(
                expression,
                format!("'{segment}' matches no value in {}..={}", bounds.start(), bounds.end()),
            ));
        }
        values
    } else if let Some((start, end)) = segment.split_once('-') {
        let (start, end) = (parse_int(start)?, parse_int(end)?);
        if start > end {
            return Err(SchedulerError::unsupported(
                expression,
                format!("empty range '{segment}'"),
            ));
        }
        (start..=end).collect()
    } else {
        vec![parse_int(segment)?]
    };

    if let Some(bad) = values.iter().find(|v| !bounds.contains(v)) {
        return Err(SchedulerError::unsupported(
            expression,
            format!("value {bad} outside {}..={}", bounds.start(), bounds.end()),
        ));
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}
