//! Channel request bodies built from effective ARI values.

use crate::{
    ari::{AriCell, CellKey, PushType},
    error::Result,
    mapping::{MappingPair, MappingTable},
    Error, ProductCode,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One product/date line of an outbound update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AriUpdate {
    pub product_code: ProductCode,
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_stay: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stay: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_to_arrival: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_to_departure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sell: Option<bool>,
}

impl AriUpdate {
    fn from_cell(product_code: ProductCode, date: NaiveDate, cell: &AriCell, push: PushType) -> Self {
        let restrictions = push.includes_restrictions();
        Self {
            product_code,
            date,
            rate: push.includes_rate().then_some(cell.rate),
            available: push.includes_availability().then_some(cell.available),
            min_stay: if restrictions { cell.min_stay } else { None },
            max_stay: if restrictions { cell.max_stay } else { None },
            closed_to_arrival: restrictions.then_some(cell.closed_to_arrival),
            closed_to_departure: restrictions.then_some(cell.closed_to_departure),
            stop_sell: restrictions.then_some(cell.stop_sell),
        }
    }
}

/// Body of an outbound ARI push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPayload {
    /// Repeated in the body for channels that ignore the header
    pub idempotency_key: String,
    pub push_type: PushType,
    pub updates: Vec<AriUpdate>,
}

impl PublishPayload {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Channel API path for a push of the given type.
pub fn publish_path(channel_property_id: &str, push_type: PushType) -> String {
    let resource = match push_type {
        PushType::Rate => "rates",
        PushType::Availability => "availability",
        PushType::Restriction => "restrictions",
        PushType::All => "ari",
    };
    format!("/properties/{channel_property_id}/{resource}")
}

/// Build the payload for a set of effective cells.
///
/// Every cell must have an active mapping; callers run the mapping gate
/// first, so a gap here is reported as a mapping error rather than skipped.
pub fn build_payload(
    idempotency_key: &str,
    push_type: PushType,
    cells: &BTreeMap<CellKey, AriCell>,
    mappings: &MappingTable,
) -> Result<PublishPayload> {
    let mut updates = Vec::with_capacity(cells.len());
    let mut missing = Vec::new();
    for (key, cell) in cells {
        let pair = MappingPair::new(key.room_type.clone(), key.rate_plan.clone());
        match mappings.product_code(&pair) {
            Some(code) => updates.push(AriUpdate::from_cell(code.clone(), key.date, cell, push_type)),
            None => missing.push(pair),
        }
    }
    if !missing.is_empty() {
        return Err(Error::MappingGap(crate::mapping::MissingMappings::new(missing)));
    }
    Ok(PublishPayload {
        idempotency_key: idempotency_key.to_string(),
        push_type,
        updates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ChannelMapping;
    use serde_json::json;

    fn cells() -> BTreeMap<CellKey, AriCell> {
        let date = NaiveDate::from_ymd_opt(2025, 9, 25).unwrap();
        let mut cells = BTreeMap::new();
        cells.insert(
            CellKey::new(date, "std", "bar"),
            AriCell {
                rate: 15000,
                available: 3,
                min_stay: Some(2),
                stop_sell: true,
                ..Default::default()
            },
        );
        cells
    }

    fn mappings() -> MappingTable {
        MappingTable::from_mappings(vec![ChannelMapping::new("c1", "std", "bar", "STD-BAR")])
    }

    #[test]
    fn rate_push_only_carries_rate() {
        let payload = build_payload("pub-1", PushType::Rate, &cells(), &mappings()).unwrap();
        let body = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            body,
            json!({
                "idempotencyKey": "pub-1",
                "pushType": "rate",
                "updates": [{"productCode": "STD-BAR", "date": "2025-09-25", "rate": 15000}]
            })
        );
    }

    #[test]
    fn restriction_push_carries_flags() {
        let payload = build_payload("pub-1", PushType::Restriction, &cells(), &mappings()).unwrap();
        let update = &payload.updates[0];
        assert_eq!(update.rate, None);
        assert_eq!(update.available, None);
        assert_eq!(update.min_stay, Some(2));
        assert_eq!(update.stop_sell, Some(true));
        assert_eq!(update.closed_to_arrival, Some(false));
    }

    #[test]
    fn unmapped_cells_are_an_error() {
        let err = build_payload("pub-1", PushType::All, &cells(), &MappingTable::new()).unwrap_err();
        assert!(matches!(err, Error::MappingGap(_)));
    }

    #[test]
    fn paths_by_push_type() {
        assert_eq!(publish_path("H1", PushType::Rate), "/properties/H1/rates");
        assert_eq!(publish_path("H1", PushType::All), "/properties/H1/ari");
    }
}
