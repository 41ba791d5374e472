//! Day, month and year scopes and the aggregates kept for them

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A calendar month, rendered as `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MAX)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Every day of the month, in order
    pub fn days(&self) -> Vec<NaiveDate> {
        self.first_day()
            .iter_days()
            .take_while(|d| d.month() == self.month)
            .collect()
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid year-month: {}", s))?;
        let year = year
            .parse::<i32>()
            .map_err(|_| format!("Invalid year in {}", s))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| format!("Invalid month in {}", s))?;
        YearMonth::new(year, month).ok_or_else(|| format!("Invalid year-month: {}", s))
    }
}

/// Unit of aggregation and reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Scope {
    Day(NaiveDate),
    Month(YearMonth),
    Year(i32),
}

impl Scope {
    /// Every calendar day covered by the scope
    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            Scope::Day(date) => vec![*date],
            Scope::Month(ym) => ym.days(),
            Scope::Year(_) => self.months().iter().flat_map(|m| m.days()).collect(),
        }
    }

    /// Every month touched by the scope
    pub fn months(&self) -> Vec<YearMonth> {
        match self {
            Scope::Day(date) => vec![YearMonth::of(*date)],
            Scope::Month(ym) => vec![*ym],
            Scope::Year(year) => (1..=12)
                .filter_map(|month| YearMonth::new(*year, month))
                .collect(),
        }
    }

    pub fn year(&self) -> i32 {
        match self {
            Scope::Day(date) => date.year(),
            Scope::Month(ym) => ym.year,
            Scope::Year(year) => *year,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Day(_) => "day",
            Scope::Month(_) => "month",
            Scope::Year(_) => "year",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Day(date) => write!(f, "{}", date),
            Scope::Month(ym) => write!(f, "{}", ym),
            Scope::Year(year) => write!(f, "{:04}", year),
        }
    }
}

/// Totals stored for a day, month or year.
///
/// Derived data: a day is summed from its records, a month from its days,
/// a year from its months.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeAggregate {
    pub scope: Scope,
    /// Sum of absolute curtailed volume, MWh
    pub total_energy: f64,
    pub total_payment: f64,
    pub record_count: i64,
    pub last_recomputed_at: DateTime<Utc>,
}

impl ScopeAggregate {
    /// Whether the totals agree with another aggregate within `tolerance`
    pub fn totals_match(&self, energy: f64, payment: f64, tolerance: f64) -> bool {
        approx_eq(self.total_energy, energy, tolerance)
            && approx_eq(self.total_payment, payment, tolerance)
    }
}

/// Relative-or-absolute float comparison used for aggregate checks
pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tolerance * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_parse_and_display() {
        let ym: YearMonth = "2024-02".parse().unwrap();
        assert_eq!(ym, YearMonth { year: 2024, month: 2 });
        assert_eq!(ym.to_string(), "2024-02");
        assert!("2024-13".parse::<YearMonth>().is_err());
        assert!("202402".parse::<YearMonth>().is_err());
    }

    #[test]
    fn test_year_month_days_handles_leap_year() {
        let feb = YearMonth::new(2024, 2).unwrap();
        assert_eq!(feb.days().len(), 29);
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let dec = YearMonth::new(2023, 12).unwrap();
        assert_eq!(dec.next(), YearMonth::new(2024, 1).unwrap());
        assert_eq!(dec.last_day(), NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_scope_dates() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();
        assert_eq!(Scope::Day(day).dates(), vec![day]);
        assert_eq!(Scope::Month(YearMonth::of(day)).dates().len(), 31);
        assert_eq!(Scope::Year(2023).dates().len(), 365);
        assert_eq!(Scope::Year(2024).months().len(), 12);
    }

    #[test]
    fn test_approx_eq_scales_with_magnitude() {
        assert!(approx_eq(1_000_000.0, 1_000_000.0005, 1e-9));
        assert!(!approx_eq(1_000_000.0, 1_000_000.002, 1e-9));
        assert!(!approx_eq(1.0, 1.1, 1e-9));
        assert!(approx_eq(0.0, 0.0, 1e-9));
    }
}
