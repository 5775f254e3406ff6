//! Lookup tables feeding the scoring policies.
//!
//! Each table parses from a compact string so it can be supplied through the
//! environment, and defaults to the production values.
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid table entry {entry:?}: {reason}")]
pub struct ParseTableError {
    pub entry: String,
    pub reason: &'static str,
}

impl ParseTableError {
    fn new(entry: &str, reason: &'static str) -> Self {
        Self {
            entry: entry.to_owned(),
            reason,
        }
    }
}

/// Split `"key=value,key=value"` into trimmed pairs, skipping empty entries.
fn entries(s: &str) -> impl Iterator<Item = Result<(&str, f64), ParseTableError>> + '_ {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
}

fn parse_entry(entry: &str) -> Result<(&str, f64), ParseTableError> {
    let (key, value) = entry
        .split_once('=')
        .ok_or_else(|| ParseTableError::new(entry, "expected key=value"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| ParseTableError::new(entry, "value must be a non-negative number"))?;

    Ok((key.trim(), value))
}

/// Relevance multiplier per `(content category, advertiser category)` pair.
/// Pairs not listed score 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceTable(HashMap<(String, String), f64>);

impl RelevanceTable {
    pub fn multiplier(&self, content_category: &str, advertiser_category: Option<&str>) -> f64 {
        advertiser_category
            .and_then(|category| {
                self.0
                    .get(&(content_category.to_owned(), category.to_owned()))
                    .copied()
            })
            .unwrap_or(1.0)
    }
}

impl FromStr for RelevanceTable {
    type Err = ParseTableError;

    /// Parses `"sports:sportswear=1.4,finance:fintech=1.5"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        entries(s)
            .map(|entry| -> Result<((String, String), f64), ParseTableError> {
                let (key, multiplier) = entry?;
                let (content, advertiser) = key
                    .split_once(':')
                    .ok_or_else(|| ParseTableError::new(key, "expected content:advertiser"))?;
                Ok((
                    (
                        content.trim().to_ascii_lowercase(),
                        advertiser.trim().to_ascii_lowercase(),
                    ),
                    multiplier,
                ))
            })
            .collect::<Result<_, _>>()
            .map(RelevanceTable)
    }
}

pub const DEFAULT_RELEVANCE_MULTIPLIERS: &str = "sports:sportswear=1.4,sports:energy_drink=1.3,\
     finance:fintech=1.5,finance:insurance=1.3,\
     entertainment:streaming=1.4,entertainment:gaming=1.3,\
     lifestyle:beauty=1.3,lifestyle:travel=1.2";

impl Default for RelevanceTable {
    fn default() -> Self {
        DEFAULT_RELEVANCE_MULTIPLIERS
            .parse()
            .expect("default relevance table is valid")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    /// Inclusive UTC hour.
    pub start_hour: u32,
    /// Exclusive UTC hour.
    pub end_hour: u32,
    pub bonus: f64,
}

/// Bonus by hour of day. The first window containing the hour wins; other hours score 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindowTable(Vec<TimeWindow>);

impl TimeWindowTable {
    pub fn bonus(&self, hour: u32) -> f64 {
        self.0
            .iter()
            .find(|window| window.start_hour <= hour && hour < window.end_hour)
            .map(|window| window.bonus)
            .unwrap_or(1.0)
    }
}

impl FromStr for TimeWindowTable {
    type Err = ParseTableError;

    /// Parses `"6-9=1.20,12-14=1.15"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        entries(s)
            .map(|entry| -> Result<TimeWindow, ParseTableError> {
                let (key, bonus) = entry?;
                let (start, end) = key
                    .split_once('-')
                    .ok_or_else(|| ParseTableError::new(key, "expected start-end hours"))?;
                let start_hour = start.trim().parse::<u32>().ok();
                let end_hour = end.trim().parse::<u32>().ok();

                match (start_hour, end_hour) {
                    (Some(start_hour), Some(end_hour))
                        if start_hour < end_hour && end_hour <= 24 =>
                    {
                        Ok(TimeWindow {
                            start_hour,
                            end_hour,
                            bonus,
                        })
                    }
                    _ => Err(ParseTableError::new(key, "hours must satisfy start < end <= 24")),
                }
            })
            .collect::<Result<_, _>>()
            .map(TimeWindowTable)
    }
}

/// Morning commute, lunch browsing, evening peak.
pub const DEFAULT_TIME_WINDOW_BONUSES: &str = "6-9=1.20,12-14=1.15,19-23=1.25";

impl Default for TimeWindowTable {
    fn default() -> Self {
        DEFAULT_TIME_WINDOW_BONUSES
            .parse()
            .expect("default time window table is valid")
    }
}

/// Bonus by device type. Unlisted devices score 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBonusTable(HashMap<String, f64>);

impl DeviceBonusTable {
    pub fn bonus(&self, device_type: &str) -> f64 {
        self.0.get(device_type).copied().unwrap_or(1.0)
    }
}

impl FromStr for DeviceBonusTable {
    type Err = ParseTableError;

    /// Parses `"mobile=1.1,desktop=1.0"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        entries(s)
            .map(|entry| entry.map(|(device, bonus)| (device.to_ascii_lowercase(), bonus)))
            .collect::<Result<_, _>>()
            .map(DeviceBonusTable)
    }
}

pub const DEFAULT_DEVICE_BONUSES: &str = "mobile=1.1,desktop=1.0";

impl Default for DeviceBonusTable {
    fn default() -> Self {
        DEFAULT_DEVICE_BONUSES
            .parse()
            .expect("default device bonus table is valid")
    }
}

/// A comma-separated set of lowercased categories. The empty string is the empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryList(HashSet<String>);

impl CategoryList {
    pub fn contains(&self, category: &str) -> bool {
        self.0.contains(category)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for CategoryList {
    type Err = ParseTableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CategoryList(
            s.split(',')
                .map(|category| category.trim().to_ascii_lowercase())
                .filter(|category| !category.is_empty())
                .collect(),
        ))
    }
}

impl<const N: usize> From<[&str; N]> for CategoryList {
    fn from(categories: [&str; N]) -> Self {
        CategoryList(
            categories
                .iter()
                .map(|category| category.to_ascii_lowercase())
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relevance_table() {
        let table = RelevanceTable::default();

        assert_eq!(table.multiplier("sports", Some("sportswear")), 1.4);
        assert_eq!(table.multiplier("finance", Some("fintech")), 1.5);
        assert_eq!(table.multiplier("lifestyle", Some("travel")), 1.2);
        assert_eq!(table.multiplier("sports", Some("fast_food")), 1.0);
        assert_eq!(table.multiplier("sports", None), 1.0);
        // Pairs are directional.
        assert_eq!(table.multiplier("sportswear", Some("sports")), 1.0);
    }

    #[test]
    fn test_default_time_windows() {
        let table = TimeWindowTable::default();

        assert_eq!(table.bonus(5), 1.0);
        assert_eq!(table.bonus(6), 1.20);
        assert_eq!(table.bonus(8), 1.20);
        assert_eq!(table.bonus(9), 1.0);
        assert_eq!(table.bonus(13), 1.15);
        assert_eq!(table.bonus(15), 1.0);
        assert_eq!(table.bonus(20), 1.25);
        assert_eq!(table.bonus(23), 1.0);
    }

    #[test]
    fn test_default_device_bonus() {
        let table = DeviceBonusTable::default();

        assert_eq!(table.bonus("mobile"), 1.1);
        assert_eq!(table.bonus("desktop"), 1.0);
        assert_eq!(table.bonus("unknown"), 1.0);
    }

    #[test]
    fn test_parse_custom_tables() {
        let relevance: RelevanceTable = " Travel:Airline=2.0 , ".parse().unwrap();
        assert_eq!(relevance.multiplier("travel", Some("airline")), 2.0);

        let windows: TimeWindowTable = "0-24=1.5".parse().unwrap();
        assert_eq!(windows.bonus(3), 1.5);

        let devices: DeviceBonusTable = "".parse().unwrap();
        assert_eq!(devices.bonus("mobile"), 1.0);

        let blocked: CategoryList = "Gambling, tobacco,,".parse().unwrap();
        assert!(blocked.contains("gambling"));
        assert!(blocked.contains("tobacco"));
        assert!(!blocked.contains("sports"));
        assert!("".parse::<CategoryList>().unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!("sports=1.4".parse::<RelevanceTable>().is_err());
        assert!("sports:sportswear".parse::<RelevanceTable>().is_err());
        assert!("sports:sportswear=-1".parse::<RelevanceTable>().is_err());
        assert!("9-6=1.2".parse::<TimeWindowTable>().is_err());
        assert!("20-25=1.2".parse::<TimeWindowTable>().is_err());
        assert!("mobile=fast".parse::<DeviceBonusTable>().is_err());
    }
}
