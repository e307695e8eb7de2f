//! Availability, rate and restriction values.
//!
//! An [`AriCell`] is the full set of values a property exposes to a channel
//! for one night of one room type under one rate plan. Cells are addressed
//! by a structured [`CellKey`], never by a concatenated string.

use crate::{error::Result, Error, RatePlanId, RoomTypeId};
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique address of an ARI cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellKey {
    pub date: NaiveDate,
    pub room_type: RoomTypeId,
    pub rate_plan: RatePlanId,
}

impl CellKey {
    pub fn new(
        date: NaiveDate,
        room_type: impl Into<RoomTypeId>,
        rate_plan: impl Into<RatePlanId>,
    ) -> Self {
        Self {
            date,
            room_type: room_type.into(),
            rate_plan: rate_plan.into(),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.date, self.room_type, self.rate_plan)
    }
}

/// Values of a single ARI cell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AriCell {
    /// Nightly rate in minor currency units
    pub rate: i64,
    /// Rooms available to sell
    pub available: u32,
    /// Minimum length of stay in nights
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stay: Option<u16>,
    /// Maximum length of stay in nights
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stay: Option<u16>,
    #[serde(default)]
    pub closed_to_arrival: bool,
    #[serde(default)]
    pub closed_to_departure: bool,
    #[serde(default)]
    pub stop_sell: bool,
    /// Set manually rather than derived from a base rate or inventory
    #[serde(default)]
    pub overridden: bool,
}

impl AriCell {
    /// Check the cell for values no channel would accept.
    pub fn validate(&self) -> Result<()> {
        if self.rate < 0 {
            return Err(Error::InvalidPayload(format!(
                "negative rate: {}",
                self.rate
            )));
        }
        if let (Some(min), Some(max)) = (self.min_stay, self.max_stay) {
            if min > max {
                return Err(Error::InvalidPayload(format!(
                    "min stay {min} exceeds max stay {max}"
                )));
            }
        }
        if self.min_stay == Some(0) {
            return Err(Error::InvalidPayload("min stay must be at least 1".into()));
        }
        Ok(())
    }

    /// Take `rooms` out of availability, saturating at zero.
    pub fn decrement(&mut self, rooms: u32) {
        self.available = self.available.saturating_sub(rooms);
    }

    /// Copy of `self` with the values covered by `push` taken from `source`.
    ///
    /// The `overridden` marker follows the pushed values.
    pub fn with_pushed(&self, source: &AriCell, push: PushType) -> AriCell {
        let mut cell = self.clone();
        if push.includes_rate() {
            cell.rate = source.rate;
        }
        if push.includes_availability() {
            cell.available = source.available;
        }
        if push.includes_restrictions() {
            cell.min_stay = source.min_stay;
            cell.max_stay = source.max_stay;
            cell.closed_to_arrival = source.closed_to_arrival;
            cell.closed_to_departure = source.closed_to_departure;
            cell.stop_sell = source.stop_sell;
        }
        cell.overridden = source.overridden;
        cell
    }

    /// Whether both cells agree on every value a `push` sends.
    pub fn pushed_eq(&self, other: &AriCell, push: PushType) -> bool {
        if push == PushType::All {
            return self == other;
        }
        (!push.includes_rate() || self.rate == other.rate)
            && (!push.includes_availability() || self.available == other.available)
            && (!push.includes_restrictions() || self.restrictions() == other.restrictions())
    }

    fn restrictions(&self) -> (Option<u16>, Option<u16>, bool, bool, bool) {
        (
            self.min_stay,
            self.max_stay,
            self.closed_to_arrival,
            self.closed_to_departure,
            self.stop_sell,
        )
    }
}

/// Which slice of the ARI values a publish pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushType {
    Rate,
    Availability,
    Restriction,
    All,
}

impl PushType {
    pub fn includes_rate(self) -> bool {
        matches!(self, PushType::Rate | PushType::All)
    }

    pub fn includes_availability(self) -> bool {
        matches!(self, PushType::Availability | PushType::All)
    }

    pub fn includes_restrictions(self) -> bool {
        matches!(self, PushType::Restriction | PushType::All)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PushType::Rate => "rate",
            PushType::Availability => "availability",
            PushType::Restriction => "restriction",
            PushType::All => "all",
        }
    }

    /// Narrowest push type covering what changed between two cells.
    ///
    /// Returns `None` when the pushed values are identical.
    pub fn for_change(before: Option<&AriCell>, after: &AriCell) -> Option<PushType> {
        let Some(before) = before else {
            return Some(PushType::All);
        };
        let rate = before.rate != after.rate;
        let availability = before.available != after.available;
        let restrictions = before.min_stay != after.min_stay
            || before.max_stay != after.max_stay
            || before.closed_to_arrival != after.closed_to_arrival
            || before.closed_to_departure != after.closed_to_departure
            || before.stop_sell != after.stop_sell;

        match (rate, availability, restrictions) {
            (false, false, false) => None,
            (true, false, false) => Some(PushType::Rate),
            (false, true, false) => Some(PushType::Availability),
            (false, false, true) => Some(PushType::Restriction),
            _ => Some(PushType::All),
        }
    }

    /// Smallest push type covering both.
    pub fn union(self, other: PushType) -> PushType {
        if self == other {
            self
        } else {
            PushType::All
        }
    }
}

impl fmt::Display for PushType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PushType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rate" => Ok(PushType::Rate),
            "availability" => Ok(PushType::Availability),
            "restriction" => Ok(PushType::Restriction),
            "all" => Ok(PushType::All),
            other => Err(Error::InvalidPayload(format!("unknown push type: {other}"))),
        }
    }
}

/// Longest date range accepted, in days.
pub const MAX_RANGE_DAYS: i64 = 730;

/// Inclusive range of stay dates, at most [`MAX_RANGE_DAYS`] long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawDateRange")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = Error;

    fn try_from(raw: RawDateRange) -> Result<Self> {
        DateRange::new(raw.start, raw.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidPayload(format!(
                "date range ends before it starts: {start}..{end}"
            )));
        }
        if (end - start).num_days() >= MAX_RANGE_DAYS {
            return Err(Error::InvalidPayload(format!(
                "date range {start}..{end} exceeds {MAX_RANGE_DAYS} days"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Iterate every date in the range.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn day_count(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }
}

/// Partial edit applied on top of an effective cell before staging.
///
/// Staging always stores full cells; a patch is resolved against the
/// current effective value first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AriPatch {
    #[serde(default)]
    pub rate: Option<i64>,
    #[serde(default)]
    pub available: Option<u32>,
    #[serde(default)]
    pub min_stay: Option<u16>,
    #[serde(default)]
    pub max_stay: Option<u16>,
    #[serde(default)]
    pub closed_to_arrival: Option<bool>,
    #[serde(default)]
    pub closed_to_departure: Option<bool>,
    #[serde(default)]
    pub stop_sell: Option<bool>,
}

impl AriPatch {
    pub fn is_empty(&self) -> bool {
        *self == AriPatch::default()
    }

    /// Resolve the patch into a full cell.
    ///
    /// Patched cells are marked as overridden.
    pub fn apply_to(&self, base: Option<&AriCell>) -> AriCell {
        let mut cell = base.cloned().unwrap_or_default();
        if let Some(rate) = self.rate {
            cell.rate = rate;
        }
        if let Some(available) = self.available {
            cell.available = available;
        }
        if let Some(min) = self.min_stay {
            cell.min_stay = Some(min);
        }
        if let Some(max) = self.max_stay {
            cell.max_stay = Some(max);
        }
        if let Some(cta) = self.closed_to_arrival {
            cell.closed_to_arrival = cta;
        }
        if let Some(ctd) = self.closed_to_departure {
            cell.closed_to_departure = ctd;
        }
        if let Some(stop) = self.stop_sell {
            cell.stop_sell = stop;
        }
        cell.overridden = true;
        cell
    }
}

/// A patch applied across dates, room types and rate plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEdit {
    pub range: DateRange,
    pub room_types: Vec<RoomTypeId>,
    pub rate_plans: Vec<RatePlanId>,
    /// Restrict to these weekdays; empty means every day
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub patch: AriPatch,
}

impl BulkEdit {
    /// Every cell key the edit touches, in key order.
    pub fn keys(&self) -> Vec<CellKey> {
        let mut keys = Vec::new();
        for date in self.range.days() {
            if !self.weekdays.is_empty() && !self.weekdays.contains(&date.weekday()) {
                continue;
            }
            for room_type in &self.room_types {
                for rate_plan in &self.rate_plans {
                    keys.push(CellKey::new(date, room_type.clone(), rate_plan.clone()));
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, d).unwrap()
    }

    #[test]
    fn cell_key_ordering_is_by_date_first() {
        let a = CellKey::new(date(25), "std", "bar");
        let b = CellKey::new(date(24), "suite", "bar");
        assert!(b < a);
        assert_eq!(a.to_string(), "2025-09-25/std/bar");
    }

    #[test]
    fn validate_rejects_inverted_stay() {
        let cell = AriCell {
            min_stay: Some(5),
            max_stay: Some(2),
            ..Default::default()
        };
        assert!(matches!(cell.validate(), Err(Error::InvalidPayload(_))));

        let cell = AriCell {
            rate: -1,
            ..Default::default()
        };
        assert!(cell.validate().is_err());
        assert!(AriCell::default().validate().is_ok());
    }

    #[test]
    fn decrement_saturates() {
        let mut cell = AriCell {
            available: 1,
            ..Default::default()
        };
        cell.decrement(3);
        assert_eq!(cell.available, 0);
    }

    #[test]
    fn push_type_for_change() {
        let base = AriCell {
            rate: 10000,
            available: 4,
            ..Default::default()
        };
        let mut rate_only = base.clone();
        rate_only.rate = 12000;
        assert_eq!(
            PushType::for_change(Some(&base), &rate_only),
            Some(PushType::Rate)
        );

        let mut stop = base.clone();
        stop.stop_sell = true;
        assert_eq!(
            PushType::for_change(Some(&base), &stop),
            Some(PushType::Restriction)
        );

        let mut both = rate_only.clone();
        both.available = 2;
        assert_eq!(PushType::for_change(Some(&base), &both), Some(PushType::All));
        assert_eq!(PushType::for_change(Some(&base), &base), None);
        assert_eq!(PushType::for_change(None, &base), Some(PushType::All));
        assert_eq!(PushType::Rate.union(PushType::Rate), PushType::Rate);
        assert_eq!(PushType::Rate.union(PushType::Availability), PushType::All);
    }

    #[test]
    fn date_range_days() {
        let range = DateRange::new(date(25), date(27)).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days, vec![date(25), date(26), date(27)]);
        assert_eq!(range.day_count(), 3);
        assert!(DateRange::new(date(27), date(25)).is_err());

        let far = date(25) + chrono::Duration::days(MAX_RANGE_DAYS);
        assert!(DateRange::new(date(25), far).is_err());
        assert!(DateRange::new(date(25), far.pred_opt().unwrap()).is_ok());

        let decoded: std::result::Result<DateRange, _> =
            serde_json::from_str(r#"{"start":"2025-01-01","end":"9999-12-31"}"#);
        assert!(decoded.is_err());
    }

    #[test]
    fn patch_keeps_unpatched_fields() {
        let base = AriCell {
            rate: 10000,
            available: 4,
            stop_sell: true,
            ..Default::default()
        };
        let patch = AriPatch {
            rate: Some(15000),
            ..Default::default()
        };
        let cell = patch.apply_to(Some(&base));
        assert_eq!(cell.rate, 15000);
        assert_eq!(cell.available, 4);
        assert!(cell.stop_sell);
        assert!(cell.overridden);
    }

    #[test]
    fn bulk_edit_filters_weekdays() {
        // 2025-09-22 is a Monday
        let edit = BulkEdit {
            range: DateRange::new(date(22), date(28)).unwrap(),
            room_types: vec!["std".into(), "dlx".into()],
            rate_plans: vec!["bar".into()],
            weekdays: vec![Weekday::Sat, Weekday::Sun],
            patch: AriPatch::default(),
        };
        let keys = edit.keys();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k.date == date(27) || k.date == date(28)));
    }
}
