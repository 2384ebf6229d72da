//! Dataset report over a JSON-Lines output file.

use crate::models::GroupRecord;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

static MEMBER_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+(?:[.,]\d+)*)\s*([KMB])?\b").unwrap());

/// Parse a formatted member count.
///
/// `K`, `M` and `B` suffixes scale the number. Without a suffix commas and
/// dots group thousands; with one a comma is read as a decimal point.
///
/// # Arguments
///
/// * `text` - Display text such as `"1.2K members"` or `"3,400"`
///
/// # Returns
///
/// The count, or `None` when the text holds no number. Values past
/// `u64::MAX` saturate.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(parse_member_count("1.2K members"), Some(1_200));
/// assert_eq!(parse_member_count("1,5K"), Some(1_500));
/// assert_eq!(parse_member_count("members"), None);
/// ```
pub fn parse_member_count(text: &str) -> Option<u64> {
    let caps = MEMBER_COUNT.captures(text)?;
    let digits = caps.get(1)?.as_str();
    let suffix = caps.get(2).map(|m| m.as_str().to_ascii_uppercase());

    let multiplier = match suffix.as_deref() {
        Some("K") => 1_000.0,
        Some("M") => 1_000_000.0,
        Some("B") => 1_000_000_000.0,
        _ => 1.0,
    };
    // With a suffix "1,5K" is European notation; without one commas group thousands.
    let number: f64 = if multiplier > 1.0 {
        digits.replace(',', ".").parse().ok()?
    } else {
        digits.replace([',', '.'], "").parse().ok()?
    };
    Some((number * multiplier).round() as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberStats {
    pub parsed: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub median: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub total: usize,
    pub unique: usize,
    /// `(city_state, count)`, largest first.
    pub top_locations: Vec<(String, usize)>,
    pub locations: usize,
    pub privacy: BTreeMap<String, usize>,
    pub members: Option<MemberStats>,
}

/// Build a report; duplicates count toward `total` only.
pub fn build_report(records: &[GroupRecord], top: usize) -> StatsReport {
    let unique: Vec<&GroupRecord> = records.iter().unique_by(|r| r.id.as_str()).collect();

    let by_location = unique
        .iter()
        .map(|r| r.city_state.clone().unwrap_or_else(|| "(unknown)".into()))
        .counts();
    let locations = by_location.len();
    let top_locations = by_location
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .take(top)
        .collect();

    let mut privacy = BTreeMap::new();
    for r in &unique {
        let key = r.privacy.clone().unwrap_or_else(|| "(unknown)".into());
        *privacy.entry(key).or_insert(0) += 1;
    }

    let counts: Vec<u64> = unique
        .iter()
        .filter_map(|r| r.member_count.as_deref().and_then(parse_member_count))
        .sorted()
        .collect();
    let members = member_stats(&counts);

    StatsReport {
        total: records.len(),
        unique: unique.len(),
        top_locations,
        locations,
        privacy,
        members,
    }
}

fn member_stats(sorted: &[u64]) -> Option<MemberStats> {
    let (&min, &max) = (sorted.first()?, sorted.last()?);
    let total = sorted.iter().fold(0u64, |acc, n| acc.saturating_add(*n));
    let mean = sorted.iter().map(|&n| n as f64).sum::<f64>() / sorted.len() as f64;
    Some(MemberStats {
        parsed: sorted.len(),
        min,
        max,
        mean,
        median: sorted[sorted.len() / 2],
        total,
    })
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Records:        {}", self.total)?;
        writeln!(f, "Unique ids:     {}", self.unique)?;
        writeln!(f, "Duplicates:     {}", self.total - self.unique)?;
        writeln!(f, "Locations:      {}", self.locations)?;
        writeln!(f)?;
        writeln!(f, "Top locations:")?;
        for (location, count) in &self.top_locations {
            writeln!(f, "  {count:>7}  {location}")?;
        }
        writeln!(f)?;
        writeln!(f, "Privacy:")?;
        for (kind, count) in &self.privacy {
            writeln!(f, "  {count:>7}  {kind}")?;
        }
        if let Some(m) = &self.members {
            writeln!(f)?;
            writeln!(f, "Members ({} groups with a count):", m.parsed)?;
            writeln!(f, "  min {}  median {}  mean {:.0}  max {}", m.min, m.median, m.mean, m.max)?;
            writeln!(f, "  total {}", m.total)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, city: &str, privacy: Option<&str>, members: Option<&str>) -> GroupRecord {
        let mut r = GroupRecord::new(id);
        r.city_state = Some(city.into());
        r.privacy = privacy.map(String::from);
        r.member_count = members.map(String::from);
        r
    }

    #[test]
    fn test_parse_member_count() {
        assert_eq!(parse_member_count("1.2K members"), Some(1_200));
        assert_eq!(parse_member_count("3,400"), Some(3_400));
        assert_eq!(parse_member_count("2M"), Some(2_000_000));
        assert_eq!(parse_member_count("12 members"), Some(12));
        assert_eq!(parse_member_count("1,234,567 members"), Some(1_234_567));
        assert_eq!(parse_member_count("4.5k"), Some(4_500));
        assert_eq!(parse_member_count("no members"), None);
    }

    #[test]
    fn test_build_report() {
        let records = vec![
            record("1", "Dallas, TX", Some("Public"), Some("1.2K members")),
            record("2", "Dallas, TX", Some("Private"), Some("300 members")),
            record("3", "Austin, TX", Some("Public"), None),
            record("1", "Dallas, TX", Some("Public"), Some("1.2K members")),
        ];
        let report = build_report(&records, 1);
        assert_eq!(report.total, 4);
        assert_eq!(report.unique, 3);
        assert_eq!(report.locations, 2);
        assert_eq!(report.top_locations, vec![("Dallas, TX".to_string(), 2)]);
        assert_eq!(report.privacy.get("Public"), Some(&2));

        let members = report.members.clone().unwrap();
        assert_eq!(members.parsed, 2);
        assert_eq!((members.min, members.max, members.total), (300, 1_200, 1_500));

        let text = report.to_string();
        assert!(text.contains("Duplicates:     1"));
        assert!(text.contains("Dallas, TX"));
    }

    #[test]
    fn test_huge_member_counts_saturate() {
        let records = vec![
            record("1", "Reno, NV", None, Some("999999999999999999B members")),
            record("2", "Reno, NV", None, Some("999999999999999999B members")),
            record("3", "Reno, NV", None, Some("10 members")),
        ];
        let members = build_report(&records, 5).members.unwrap();
        assert_eq!(members.max, u64::MAX);
        assert_eq!(members.total, u64::MAX);
        assert_eq!(members.min, 10);
        assert!(members.mean.is_finite());
        assert!(build_report(&records, 5).to_string().contains("total 18446744073709551615"));
    }

    #[test]
    fn test_empty_report() {
        let report = build_report(&[], 10);
        assert_eq!(report.unique, 0);
        assert!(report.members.is_none());
        assert!(report.top_locations.is_empty());
    }
}
