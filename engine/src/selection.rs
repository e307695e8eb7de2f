//! Copy/paste of ARI cells.
//!
//! A selection belongs to one operator request. It is passed explicitly to
//! whatever needs it; nothing here is process-wide.

use crate::ari::{AriCell, CellKey};
use crate::{error::Result, Error, RatePlanId, RoomTypeId};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Cells picked by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub cells: Vec<CellKey>,
}

impl Selection {
    pub fn new(cells: Vec<CellKey>) -> Self {
        Self { cells }
    }

    pub fn anchor(&self) -> Option<NaiveDate> {
        self.cells.iter().map(|k| k.date).min()
    }

    /// Copy the selected cells using `read` to get each effective value.
    ///
    /// Cells with no value are left out of the clipboard.
    pub fn copy(&self, read: impl Fn(&CellKey) -> Option<AriCell>) -> Clipboard {
        let Some(anchor) = self.anchor() else {
            return Clipboard::default();
        };
        let entries = self
            .cells
            .iter()
            .filter_map(|key| {
                read(key).map(|cell| ClipEntry {
                    offset_days: (key.date - anchor).num_days(),
                    room_type: key.room_type.clone(),
                    rate_plan: key.rate_plan.clone(),
                    cell,
                })
            })
            .collect();
        Clipboard { entries }
    }
}

/// One copied cell, relative to the earliest selected date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipEntry {
    pub offset_days: i64,
    pub room_type: RoomTypeId,
    pub rate_plan: RatePlanId,
    pub cell: AriCell,
}

/// Copied cells ready to paste at another date.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Clipboard {
    pub entries: Vec<ClipEntry>,
}

impl Clipboard {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cells to stage when pasting with the earliest copied date at `anchor`.
    ///
    /// Fails if a pasted date falls outside the calendar.
    pub fn paste_at(&self, anchor: NaiveDate) -> Result<Vec<(CellKey, AriCell)>> {
        self.entries
            .iter()
            .map(|entry| {
                let date = Duration::try_days(entry.offset_days)
                    .and_then(|offset| anchor.checked_add_signed(offset))
                    .ok_or_else(|| {
                        Error::InvalidPayload(format!(
                            "paste at {anchor} + {} days is out of range",
                            entry.offset_days
                        ))
                    })?;
                let mut cell = entry.cell.clone();
                cell.overridden = true;
                Ok((
                    CellKey::new(date, entry.room_type.clone(), entry.rate_plan.clone()),
                    cell,
                ))
            })
            .collect()
    }
}
