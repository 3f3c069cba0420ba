//! Domain vocabulary shared by the sync and the dashboard queries.
//!
//! Academic years are always derived from a single record's own date and its
//! establishment's region; nothing here keeps state between records.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Month (1-based) on which the northern-hemisphere academic year begins.
pub const ACADEMIC_YEAR_START_MONTH: u32 = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// August to July school calendar.
    #[default]
    Standard,
    /// Calendar-year school calendar used by Australian establishments.
    Australian,
}

impl Region {
    pub fn from_australian_flag(is_australian: bool) -> Self {
        if is_australian { Region::Australian } else { Region::Standard }
    }
}

/// An academic year identified by the calendar year it starts in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AcademicYear {
    start: i32,
}

impl AcademicYear {
    pub fn new(start: i32) -> Self {
        AcademicYear { start }
    }

    pub fn for_date(date: NaiveDate, region: Region) -> Self {
        let start = match region {
            Region::Australian => date.year(),
            Region::Standard if date.month() >= ACADEMIC_YEAR_START_MONTH => date.year(),
            Region::Standard => date.year() - 1,
        };
        AcademicYear { start }
    }
}

impl Display for AcademicYear {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start, self.start + 1)
    }
}

impl FromStr for AcademicYear {
    type Err = String;

    /// Accepts `2025/2026`, `2025-2026` and `2025-26`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (first, second) = trimmed
            .split_once('/')
            .or_else(|| trimmed.split_once('-'))
            .ok_or_else(|| format!("academic year '{}' must look like YYYY/YYYY", trimmed))?;
        let start: i32 = first
            .trim()
            .parse()
            .map_err(|_| format!("academic year '{}' has a non-numeric start", trimmed))?;
        let second = second.trim();
        let end: i32 = match second.len() {
            2 => {
                let yy: i32 = second
                    .parse()
                    .map_err(|_| format!("academic year '{}' has a non-numeric end", trimmed))?;
                (start / 100) * 100 + yy + if yy < start % 100 { 100 } else { 0 }
            }
            4 => second
                .parse()
                .map_err(|_| format!("academic year '{}' has a non-numeric end", trimmed))?,
            _ => return Err(format!("academic year '{}' must look like YYYY/YYYY", trimmed)),
        };
        if end != start + 1 {
            return Err(format!("academic year '{}' spans non-consecutive years", trimmed));
        }
        Ok(AcademicYear { start })
    }
}

impl Serialize for AcademicYear {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AcademicYear {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One administration of the questionnaire within an academic year.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub struct Cycle(u8);

impl Cycle {
    pub const ALL: [Cycle; 3] = [Cycle(1), Cycle(2), Cycle(3)];

    pub fn number(&self) -> u8 {
        self.0
    }

    pub fn index(&self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<i16> for Cycle {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1..=3 => Ok(Cycle(value as u8)),
            other => Err(format!("cycle must be 1, 2 or 3 (got {})", other)),
        }
    }
}

impl From<Cycle> for i16 {
    fn from(value: Cycle) -> Self {
        i16::from(value.0)
    }
}

impl Display for Cycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VespaElement {
    Vision,
    Effort,
    Systems,
    Practice,
    Attitude,
    Overall,
}

impl VespaElement {
    pub const ALL: [VespaElement; 6] = [
        VespaElement::Vision,
        VespaElement::Effort,
        VespaElement::Systems,
        VespaElement::Practice,
        VespaElement::Attitude,
        VespaElement::Overall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VespaElement::Vision => "vision",
            VespaElement::Effort => "effort",
            VespaElement::Systems => "systems",
            VespaElement::Practice => "practice",
            VespaElement::Attitude => "attitude",
            VespaElement::Overall => "overall",
        }
    }
}

impl Display for VespaElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive bounds of a VESPA element score.
pub const SCORE_MIN: i16 = 0;
pub const SCORE_MAX: i16 = 10;

/// Inclusive bounds of a single questionnaire answer.
pub const RESPONSE_MIN: i16 = 1;
pub const RESPONSE_MAX: i16 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn standard_year_turns_over_in_august() {
        assert_eq!(AcademicYear::for_date(d(2025, 7, 31), Region::Standard).to_string(), "2024/2025");
        assert_eq!(AcademicYear::for_date(d(2025, 8, 1), Region::Standard).to_string(), "2025/2026");
        assert_eq!(AcademicYear::for_date(d(2026, 1, 15), Region::Standard).to_string(), "2025/2026");
    }

    #[test]
    fn australian_year_follows_calendar() {
        assert_eq!(AcademicYear::for_date(d(2025, 2, 3), Region::Australian).to_string(), "2025/2026");
        assert_eq!(AcademicYear::for_date(d(2025, 11, 30), Region::Australian).to_string(), "2025/2026");
        assert_eq!(AcademicYear::for_date(d(2026, 1, 5), Region::Australian).to_string(), "2026/2027");
    }

    #[test]
    fn parses_common_spellings() {
        let expected = AcademicYear::new(2025);
        assert_eq!("2025/2026".parse::<AcademicYear>().unwrap(), expected);
        assert_eq!("2025-2026".parse::<AcademicYear>().unwrap(), expected);
        assert_eq!(" 2025-26 ".parse::<AcademicYear>().unwrap(), expected);
        assert_eq!("1999/00".parse::<AcademicYear>().unwrap(), AcademicYear::new(1999));
    }

    #[test]
    fn rejects_non_consecutive_years() {
        assert!("2025/2027".parse::<AcademicYear>().is_err());
        assert!("2025".parse::<AcademicYear>().is_err());
        assert!("abcd/2026".parse::<AcademicYear>().is_err());
    }

    #[test]
    fn cycle_bounds() {
        assert!(Cycle::try_from(0).is_err());
        assert!(Cycle::try_from(4).is_err());
        assert_eq!(Cycle::try_from(2).unwrap().index(), 1);
    }

    #[test]
    fn academic_year_serializes_as_string() {
        let json = serde_json::to_string(&AcademicYear::new(2024)).unwrap();
        assert_eq!(json, "\"2024/2025\"");
        let back: AcademicYear = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AcademicYear::new(2024));
    }
}
