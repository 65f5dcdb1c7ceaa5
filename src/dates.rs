use chrono::{Datelike, Local, NaiveDate};

use crate::error::{FinchError, Result};

/// An inclusive date window. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        if let Some(from) = self.from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if date > to {
                return false;
            }
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Parse a (possibly partial) date string. `YYYY` and `YYYY-MM` expand to
/// the first day when `end_of_range` is false and the last day when true;
/// `YYYYMMDD` and `YYYY-MM-DD` are exact.
pub fn parse_date(raw: &str, end_of_range: bool) -> Result<NaiveDate> {
    let s = raw.trim();
    let bad = |_| FinchError::UserInput(format!("invalid date '{s}'"));

    if s.len() == 10 && s.as_bytes()[4] == b'-' && s.as_bytes()[7] == b'-' {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(bad);
    }
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").map_err(bad);
    }
    if s.len() == 7 && s.as_bytes()[4] == b'-' {
        let year: i32 = s[..4]
            .parse()
            .map_err(|_| FinchError::UserInput(format!("invalid date '{s}'")))?;
        let month: u32 = s[5..]
            .parse()
            .map_err(|_| FinchError::UserInput(format!("invalid date '{s}'")))?;
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| FinchError::UserInput(format!("invalid date '{s}'")))?;
        return Ok(if end_of_range { month_end(first) } else { first });
    }
    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        let year: i32 = s
            .parse()
            .map_err(|_| FinchError::UserInput(format!("invalid date '{s}'")))?;
        let date = if end_of_range {
            NaiveDate::from_ymd_opt(year, 12, 31)
        } else {
            NaiveDate::from_ymd_opt(year, 1, 1)
        };
        return date.ok_or_else(|| FinchError::UserInput(format!("invalid date '{s}'")));
    }

    Err(FinchError::UserInput(format!(
        "unsupported date format '{s}' (use YYYY-MM-DD, YYYYMMDD, YYYY-MM, or YYYY)"
    )))
}

fn month_end(first: NaiveDate) -> NaiveDate {
    let (year, month) = (first.year(), first.month());
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.unwrap().pred_opt().unwrap()
}

fn month_range(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (first, month_end(first))
}

pub fn this_month(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    month_range(today.year(), today.month())
}

pub fn last_month(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let (year, month) = if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    };
    month_range(year, month)
}

pub fn this_year(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(today.year(), 12, 31).unwrap(),
    )
}

pub fn last_year(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(today.year() - 1, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(today.year() - 1, 12, 31).unwrap(),
    )
}

/// Raw window options as they come off the command line.
#[derive(Debug, Clone, Default)]
pub struct WindowArgs {
    pub from: Option<String>,
    pub to: Option<String>,
    pub this_month: bool,
    pub last_month: bool,
    pub this_year: bool,
    pub last_year: bool,
}

/// Validate mutual exclusion and resolve to a concrete window.
/// `--to` without `--from` is rejected; convenience flags conflict with each
/// other and with explicit dates; `--from` equal to `--to` is a valid
/// single-day window (inclusive on both ends).
pub fn resolve_window(args: &WindowArgs) -> Result<DateWindow> {
    let today = Local::now().date_naive();

    if args.to.is_some() && args.from.is_none() {
        return Err(FinchError::UserInput(
            "cannot specify --to without --from".to_string(),
        ));
    }

    let mut convenience = Vec::new();
    if args.this_month {
        convenience.push("--this-month");
    }
    if args.last_month {
        convenience.push("--last-month");
    }
    if args.this_year {
        convenience.push("--this-year");
    }
    if args.last_year {
        convenience.push("--last-year");
    }

    if convenience.len() > 1 {
        return Err(FinchError::UserInput(format!(
            "conflicting date options: {}",
            convenience.join(", ")
        )));
    }
    if !convenience.is_empty() && (args.from.is_some() || args.to.is_some()) {
        return Err(FinchError::UserInput(format!(
            "{} cannot be combined with --from/--to",
            convenience[0]
        )));
    }

    let range = if args.this_month {
        Some(this_month(today))
    } else if args.last_month {
        Some(last_month(today))
    } else if args.this_year {
        Some(this_year(today))
    } else if args.last_year {
        Some(last_year(today))
    } else {
        None
    };

    if let Some((from, to)) = range {
        return Ok(DateWindow {
            from: Some(from),
            to: Some(to),
        });
    }

    let from = args
        .from
        .as_deref()
        .map(|s| parse_date(s, false))
        .transpose()?;
    let to = args.to.as_deref().map(|s| parse_date(s, true)).transpose()?;

    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(FinchError::UserInput(format!(
                "start date {f} is after end date {t}"
            )));
        }
    }

    Ok(DateWindow { from, to })
}
