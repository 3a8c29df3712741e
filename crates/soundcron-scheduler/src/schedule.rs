use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Compute the next `n` UTC fire times of `expression`, all strictly after `after`.
///
/// Accepts standard five-field cron (`min hour dom month dow`, Sunday = 0 or 7)
/// and the macro aliases `@yearly`, `@annually`, `@monthly`, `@weekly`,
/// `@daily`, `@midnight` and `@hourly`. Deterministic for a given input.
pub fn next_run_times(
    expression: &str,
    after: DateTime<Utc>,
    n: usize,
) -> Result<Vec<DateTime<Utc>>> {
    if n == 0 {
        return Err(SchedulerError::InvalidCount);
    }
    let times = parse(expression)?.upcoming(after, n);
    if times.len() < n {
        return Err(invalid(
            expression,
            format!("only {} upcoming occurrence(s), wanted {n}", times.len()),
        ));
    }
    Ok(times)
}

/// Check that `expression` parses without computing any occurrences.
pub fn validate_cron(expression: &str) -> Result<()> {
    parse(expression).map(|_| ())
}

fn parse(expression: &str) -> Result<CronSchedule> {
    let compile = |normalized: &str| {
        cron::Schedule::from_str(normalized).map_err(|e| invalid(expression, e.to_string()))
    };
    Ok(match normalize(expression)? {
        Normalized::Single(normalized) => CronSchedule::Single(compile(&normalized)?),
        Normalized::EitherDay {
            by_month_day,
            by_week_day,
        } => CronSchedule::EitherDay {
            by_month_day: compile(&by_month_day)?,
            by_week_day: compile(&by_week_day)?,
        },
    })
}

/// A compiled expression.
///
/// Five-field cron fires when either day field matches once both are
/// restricted. The `cron` crate ANDs them, so that case is held as two
/// schedules whose fire times are merged.
enum CronSchedule {
    Single(cron::Schedule),
    EitherDay {
        by_month_day: cron::Schedule,
        by_week_day: cron::Schedule,
    },
}

impl CronSchedule {
    fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let (by_month_day, by_week_day) = match self {
            CronSchedule::Single(schedule) => return schedule.after(&after).take(n).collect(),
            CronSchedule::EitherDay {
                by_month_day,
                by_week_day,
            } => (by_month_day, by_week_day),
        };

        let mut month_days = by_month_day.after(&after).peekable();
        let mut week_days = by_week_day.after(&after).peekable();
        let mut times: Vec<DateTime<Utc>> = Vec::with_capacity(n);
        while times.len() < n {
            let take_month_day = match (month_days.peek(), week_days.peek()) {
                (Some(m), Some(w)) => m <= w,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_month_day {
                month_days.next()
            } else {
                week_days.next()
            };
            let Some(next) = next else { break };
            // A day matching both fields comes out of both schedules.
            if times.last() != Some(&next) {
                times.push(next);
            }
        }
        times
    }
}

enum Normalized {
    Single(String),
    EitherDay {
        by_month_day: String,
        by_week_day: String,
    },
}

/// Rewrite a five-field expression into the seven-field
/// (`sec min hour dom month dow year`) form the `cron` crate parses.
fn normalize(expression: &str) -> Result<Normalized> {
    let trimmed = expression.trim();
    if let Some(alias) = trimmed.strip_prefix('@') {
        let expanded = match alias.to_ascii_lowercase().as_str() {
            "yearly" | "annually" => "0 0 0 1 1 * *",
            "monthly" => "0 0 0 1 * * *",
            "weekly" => "0 0 0 * * SUN *",
            "daily" | "midnight" => "0 0 0 * * * *",
            "hourly" => "0 0 * * * * *",
            other => return Err(invalid(expression, format!("unknown macro @{other}"))),
        };
        return Ok(Normalized::Single(expanded.to_string()));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let [minute, hour, dom, month, dow_field] = fields[..] else {
        return Err(invalid(
            expression,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    };
    let dow = day_of_week(dow_field).map_err(|reason| invalid(expression, reason))?;

    if is_unrestricted(dom) || is_unrestricted(dow_field) {
        return Ok(Normalized::Single(format!(
            "0 {minute} {hour} {dom} {month} {dow} *"
        )));
    }
    Ok(Normalized::EitherDay {
        by_month_day: format!("0 {minute} {hour} {dom} {month} * *"),
        by_week_day: format!("0 {minute} {hour} * {month} {dow} *"),
    })
}

/// A day field starting with `*` (including `*/n`) does not restrict the
/// other day field.
fn is_unrestricted(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

/// Translate a standard day-of-week field (0-7, Sunday = 0 and 7) into day
/// names. The `cron` crate numbers days 1-7 starting at Sunday, so numeric
/// items are spelled out rather than shifted.
fn day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step {step:?}"))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };

        let range = match base {
            "*" => Some((0, 6)),
            _ => match base.split_once('-') {
                Some((lo, hi)) => match (lo.parse::<u32>(), hi.parse::<u32>()) {
                    (Ok(lo), Ok(hi)) => Some((lo, hi)),
                    _ => None,
                },
                None => base.parse::<u32>().ok().map(|d| match step {
                    Some(_) => (d, 7),
                    None => (d, d),
                }),
            },
        };

        let Some((lo, hi)) = range else {
            // Named days (MON, Tue-Fri, ...) are understood as-is.
            items.push(item.to_string());
            continue;
        };
        if lo > 7 || hi > 7 || lo > hi {
            return Err(format!("day-of-week {base:?} out of range 0-7"));
        }

        let days: BTreeSet<usize> = (lo..=hi)
            .step_by(step.unwrap_or(1) as usize)
            .map(|d| (d % 7) as usize)
            .collect();
        items.extend(days.into_iter().map(|d| DAY_NAMES[d].to_string()));
    }
    Ok(items.join(","))
}

fn invalid(expression: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}
