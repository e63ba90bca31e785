use std::fmt;

use chrono::{DateTime, Datelike, Utc};

/// A calendar month of archived snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    /// 1-12.
    pub month: u32,
}

impl Period {
    /// Creates a period, returning `None` for a month outside 1-12.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Returns the period containing the given instant (UTC).
    pub fn containing(t: DateTime<Utc>) -> Self {
        Self {
            year: t.year(),
            month: t.month(),
        }
    }

    /// Months since year 0, used for rollover-free arithmetic.
    fn index(self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// Returns the period `months` months before this one.
    pub fn months_before(self, months: u32) -> Self {
        Self::from_index(self.index() - i64::from(months))
    }

    /// Archive directory name, e.g. `2024.01`.
    pub fn archive_dir(self) -> String {
        format!("{:04}.{:02}", self.year, self.month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Longest supported lookback. RIS archives start in 1999.
pub const MAX_LOOKBACK_MONTHS: u32 = 12 * 50;

/// Returns the `lookback_months` periods ending at the one containing
/// `reference`, oldest first.
pub fn compute_window(reference: DateTime<Utc>, lookback_months: u32) -> Vec<Period> {
    let last = Period::containing(reference);

    (0..lookback_months)
        .rev()
        .map(|offset| last.months_before(offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn p(year: i32, month: u32) -> Period {
        Period::new(year, month).expect("valid period")
    }

    #[test]
    fn test_window_within_single_year() {
        let window = compute_window(at(2024, 6, 15), 3);
        assert_eq!(window, vec![p(2024, 4), p(2024, 5), p(2024, 6)]);
    }

    #[test]
    fn test_window_rolls_over_year_boundary() {
        let window = compute_window(at(2024, 2, 1), 4);
        assert_eq!(window, vec![p(2023, 11), p(2023, 12), p(2024, 1), p(2024, 2)]);
    }

    #[test]
    fn test_window_end_of_month_has_no_day_overflow() {
        // Subtracting a month from March 31st must land in February, not March.
        let window = compute_window(at(2023, 3, 31), 2);
        assert_eq!(window, vec![p(2023, 2), p(2023, 3)]);
    }

    #[test]
    fn test_window_spanning_multiple_years() {
        let window = compute_window(at(2024, 1, 10), 25);
        assert_eq!(window.len(), 25);
        assert_eq!(window[0], p(2022, 1));
        assert_eq!(window[24], p(2024, 1));
    }

    #[test]
    fn test_window_properties_hold_for_many_inputs() {
        for year in [1999, 2000, 2023, 2024] {
            for month in 1..=12 {
                for lookback in 1..=30 {
                    let reference = at(year, month, 28);
                    let window = compute_window(reference, lookback);

                    assert_eq!(window.len(), lookback as usize);
                    assert_eq!(window.last().copied(), Some(p(year, month)));
                    for pair in window.windows(2) {
                        assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
                        assert_eq!(pair[0].index() + 1, pair[1].index());
                    }
                    assert_eq!(window, compute_window(reference, lookback));
                }
            }
        }
    }

    #[test]
    fn test_window_zero_lookback_is_empty() {
        assert!(compute_window(at(2024, 6, 1), 0).is_empty());
    }

    #[test]
    fn test_period_validation_and_formatting() {
        assert!(Period::new(2024, 0).is_none());
        assert!(Period::new(2024, 13).is_none());

        let period = p(2024, 1);
        assert_eq!(period.to_string(), "2024-01");
        assert_eq!(period.archive_dir(), "2024.01");
    }
}
