//! Local guests and reservations created from applied orders.

use crate::{
    ari::{AriCell, CellKey},
    order::{GuestDetails, ReservationPayload},
    PropertyId, RatePlanId, RoomTypeId,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A guest, unique by (property, email).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    pub id: String,
    pub property_id: PropertyId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

impl Guest {
    pub fn from_details(
        id: impl Into<String>,
        property_id: impl Into<PropertyId>,
        details: &GuestDetails,
    ) -> Self {
        Self {
            id: id.into(),
            property_id: property_id.into(),
            email: normalize_email(&details.email),
            first_name: details.first_name.clone(),
            last_name: details.last_name.clone(),
            phone: details.phone.clone(),
        }
    }

    /// Overwrite contact details with newer ones, keeping the id.
    pub fn merge(&mut self, newer: &Guest) {
        self.first_name = newer.first_name.clone();
        self.last_name = newer.last_name.clone();
        if newer.phone.is_some() {
            self.phone = newer.phone.clone();
        }
    }
}

/// Emails compare case-insensitively for guest matching.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A local reservation, unique by channel reservation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub external_id: String,
    pub property_id: PropertyId,
    pub guest_id: String,
    pub room_type: RoomTypeId,
    pub rate_plan: RatePlanId,
    pub arrival: NaiveDate,
    pub departure: NaiveDate,
    pub rooms: u32,
    pub total_amount: i64,
    pub currency: String,
}

impl Reservation {
    pub fn from_payload(
        id: impl Into<String>,
        property_id: impl Into<PropertyId>,
        guest_id: impl Into<String>,
        payload: &ReservationPayload,
    ) -> Self {
        Self {
            id: id.into(),
            external_id: payload.external_id.clone(),
            property_id: property_id.into(),
            guest_id: guest_id.into(),
            room_type: payload.room_type.clone(),
            rate_plan: payload.rate_plan.clone(),
            arrival: payload.arrival,
            departure: payload.departure,
            rooms: payload.rooms,
            total_amount: payload.total_amount,
            currency: payload.currency.clone(),
        }
    }
}

/// Committed cells after taking `rooms` out of each.
///
/// Nights with no committed value are skipped: there is no inventory to
/// take from.
pub fn decrement_inventory<'a>(
    committed: impl IntoIterator<Item = (&'a CellKey, &'a AriCell)>,
    rooms: u32,
) -> Vec<(CellKey, AriCell)> {
    committed
        .into_iter()
        .map(|(key, cell)| {
            let mut cell = cell.clone();
            cell.decrement(rooms);
            (key.clone(), cell)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_email_is_normalized() {
        let details = GuestDetails {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: " Ada@Example.COM ".into(),
            phone: None,
        };
        let guest = Guest::from_details("g1", "p1", &details);
        assert_eq!(guest.email, "ada@example.com");
    }

    #[test]
    fn merge_keeps_phone_when_missing() {
        let details = GuestDetails {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            phone: Some("+44 1".into()),
        };
        let mut guest = Guest::from_details("g1", "p1", &details);
        let newer = Guest::from_details(
            "g2",
            "p1",
            &GuestDetails {
                first_name: "Ada".into(),
                last_name: "King".into(),
                email: "ada@example.com".into(),
                phone: None,
            },
        );
        guest.merge(&newer);
        assert_eq!(guest.id, "g1");
        assert_eq!(guest.last_name, "King");
        assert_eq!(guest.phone.as_deref(), Some("+44 1"));
    }

    #[test]
    fn decrement_inventory_saturates() {
        let key = CellKey::new(NaiveDate::from_ymd_opt(2025, 9, 25).unwrap(), "std", "bar");
        let cell = AriCell {
            available: 1,
            ..Default::default()
        };
        let out = decrement_inventory([(&key, &cell)], 2);
        assert_eq!(out[0].1.available, 0);
    }
}
