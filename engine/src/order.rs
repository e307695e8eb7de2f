//! Inbound orders pushed by channels.
//!
//! An order is keyed by the channel's reservation id. It starts `pending`
//! and moves exactly once to `applied` or `rejected`. Re-delivery of a
//! terminal order is a no-op that hands back the earlier result.

use crate::{
    ari::{CellKey, DateRange, MAX_RANGE_DAYS},
    error::Result,
    mapping::MappingPair,
    ConnectionId, Error, OrderId, RatePlanId, RoomTypeId, Timestamp,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of an inbound order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Applied,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Applied => "applied",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "applied" => Ok(OrderStatus::Applied),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(Error::InvalidPayload(format!("unknown order status: {other}"))),
        }
    }
}

/// Guest details carried by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

/// The reservation a channel sends, as parsed from the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationPayload {
    pub external_id: String,
    pub channel_code: String,
    pub room_type: RoomTypeId,
    pub rate_plan: RatePlanId,
    pub arrival: NaiveDate,
    pub departure: NaiveDate,
    #[serde(default = "default_rooms")]
    pub rooms: u32,
    pub guest: GuestDetails,
    /// Total price in minor currency units
    pub total_amount: i64,
    pub currency: String,
}

fn default_rooms() -> u32 {
    1
}

impl ReservationPayload {
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: Self =
            serde_json::from_str(raw).map_err(|e| Error::InvalidPayload(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_id.trim().is_empty() {
            return Err(Error::InvalidPayload("missing external id".into()));
        }
        if self.departure <= self.arrival {
            return Err(Error::InvalidPayload(format!(
                "departure {} is not after arrival {}",
                self.departure, self.arrival
            )));
        }
        if (self.departure - self.arrival).num_days() > MAX_RANGE_DAYS {
            return Err(Error::InvalidPayload(format!(
                "stay of {} nights is too long",
                (self.departure - self.arrival).num_days()
            )));
        }
        if self.rooms == 0 {
            return Err(Error::InvalidPayload("reservation has no rooms".into()));
        }
        if !self.guest.email.contains('@') {
            return Err(Error::InvalidPayload(format!(
                "invalid guest email: {}",
                self.guest.email
            )));
        }
        Ok(())
    }

    pub fn pair(&self) -> MappingPair {
        MappingPair::new(self.room_type.clone(), self.rate_plan.clone())
    }

    /// Nights occupied: arrival up to but not including departure.
    pub fn nights(&self) -> DateRange {
        let last_night = self.departure.pred_opt().unwrap_or(self.arrival);
        DateRange {
            start: self.arrival,
            end: last_night.max(self.arrival),
        }
    }

    /// ARI cells whose availability the reservation consumes.
    pub fn inventory_keys(&self) -> Vec<CellKey> {
        self.nights()
            .days()
            .map(|date| CellKey::new(date, self.room_type.clone(), self.rate_plan.clone()))
            .collect()
    }
}

/// Result recorded when an order reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum OrderResult {
    #[serde(rename_all = "camelCase")]
    Applied { reservation_id: String },
    Rejected { reason: String },
}

/// Operator action on a pending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum OrderAction {
    Apply,
    Reject { reason: String },
}

/// A reservation received from a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundOrder {
    pub id: OrderId,
    pub connection_id: ConnectionId,
    pub external_id: String,
    pub channel_code: String,
    /// Signature check result; a bad signature flags the order for review
    /// but does not block it
    pub signature_valid: bool,
    pub signature: Option<String>,
    pub raw_payload: String,
    pub status: OrderStatus,
    pub received_at: Timestamp,
    pub processed_at: Option<Timestamp>,
    pub result: Option<OrderResult>,
}

impl InboundOrder {
    /// Build a pending order from a raw payload.
    pub fn receive(
        id: impl Into<OrderId>,
        connection_id: impl Into<ConnectionId>,
        raw_payload: impl Into<String>,
        signature: Option<String>,
        signature_valid: bool,
        now: Timestamp,
    ) -> Result<Self> {
        let raw_payload = raw_payload.into();
        let payload = ReservationPayload::parse(&raw_payload)?;
        Ok(Self {
            id: id.into(),
            connection_id: connection_id.into(),
            external_id: payload.external_id,
            channel_code: payload.channel_code,
            signature_valid,
            signature,
            raw_payload,
            status: OrderStatus::Pending,
            received_at: now,
            processed_at: None,
            result: None,
        })
    }

    pub fn payload(&self) -> Result<ReservationPayload> {
        ReservationPayload::parse(&self.raw_payload)
    }

    /// Take a re-delivery. Only pending orders pick up the new payload.
    ///
    /// Returns whether the stored order changed.
    pub fn redeliver(&mut self, newer: &InboundOrder) -> bool {
        if self.status.is_terminal() || self.raw_payload == newer.raw_payload {
            return false;
        }
        self.raw_payload = newer.raw_payload.clone();
        self.signature = newer.signature.clone();
        self.signature_valid = newer.signature_valid;
        self.received_at = newer.received_at;
        true
    }

    fn transition_error(&self, to: OrderStatus) -> Error {
        Error::InvalidTransition {
            entity: "inbound order",
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    pub fn mark_applied(&mut self, reservation_id: impl Into<String>, now: Timestamp) -> Result<()> {
        if self.status != OrderStatus::Pending {
            return Err(self.transition_error(OrderStatus::Applied));
        }
        self.status = OrderStatus::Applied;
        self.processed_at = Some(now);
        self.result = Some(OrderResult::Applied {
            reservation_id: reservation_id.into(),
        });
        Ok(())
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>, now: Timestamp) -> Result<()> {
        if self.status != OrderStatus::Pending {
            return Err(self.transition_error(OrderStatus::Rejected));
        }
        self.status = OrderStatus::Rejected;
        self.processed_at = Some(now);
        self.result = Some(OrderResult::Rejected {
            reason: reason.into(),
        });
        Ok(())
    }
}

/// What happened when an order was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiveOutcome {
    Created,
    Updated,
    Unchanged,
}

/// In-memory orders, unique by external id.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    by_external_id: HashMap<String, InboundOrder>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge by external id. Returns the stored order.
    pub fn receive(&mut self, order: InboundOrder) -> (InboundOrder, ReceiveOutcome) {
        match self.by_external_id.get_mut(&order.external_id) {
            Some(existing) => {
                let outcome = if existing.redeliver(&order) {
                    ReceiveOutcome::Updated
                } else {
                    ReceiveOutcome::Unchanged
                };
                (existing.clone(), outcome)
            }
            None => {
                self.by_external_id
                    .insert(order.external_id.clone(), order.clone());
                (order, ReceiveOutcome::Created)
            }
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&InboundOrder> {
        self.by_external_id.get(external_id)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&InboundOrder> {
        self.by_external_id.values().find(|o| o.id == id)
    }

    pub fn update(&mut self, order: InboundOrder) {
        self.by_external_id.insert(order.external_id.clone(), order);
    }

    pub fn pending(&self) -> Vec<&InboundOrder> {
        let mut pending: Vec<_> = self
            .by_external_id
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .collect();
        pending.sort_by_key(|o| o.received_at);
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_758_758_400 + secs, 0).unwrap()
    }

    fn raw(external_id: &str, room_type: &str) -> String {
        json!({
            "externalId": external_id,
            "channelCode": "BDC",
            "roomType": room_type,
            "ratePlan": "bar",
            "arrival": "2025-09-25",
            "departure": "2025-09-27",
            "guest": {"firstName": "Ada", "lastName": "Lovelace", "email": "ada@example.com"},
            "totalAmount": 30000,
            "currency": "EUR"
        })
        .to_string()
    }

    #[test]
    fn receive_parses_payload() {
        let order = InboundOrder::receive("o1", "c1", raw("R-1", "std"), None, false, at(0)).unwrap();
        assert_eq!(order.external_id, "R-1");
        assert_eq!(order.status, OrderStatus::Pending);

        let payload = order.payload().unwrap();
        assert_eq!(payload.rooms, 1);
        let keys = payload.inventory_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].date, NaiveDate::from_ymd_opt(2025, 9, 26).unwrap());
    }

    #[test]
    fn receive_rejects_bad_dates() {
        let raw = raw("R-1", "std").replace("2025-09-27", "2025-09-25");
        let err = InboundOrder::receive("o1", "c1", raw, None, true, at(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[test]
    fn receive_rejects_endless_stay() {
        let raw = raw("R-1", "std").replace("2025-09-27", "9999-12-31");
        let err = InboundOrder::receive("o1", "c1", raw, None, true, at(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[test]
    fn terminal_orders_do_not_transition() {
        let mut order =
            InboundOrder::receive("o1", "c1", raw("R-1", "std"), None, true, at(0)).unwrap();
        order.mark_applied("res-1", at(1)).unwrap();
        assert!(order.mark_applied("res-2", at(2)).is_err());
        assert!(order.mark_rejected("dup", at(2)).is_err());
        assert_eq!(
            order.result,
            Some(OrderResult::Applied {
                reservation_id: "res-1".into()
            })
        );
    }

    #[test]
    fn book_upserts_by_external_id() {
        let mut book = OrderBook::new();
        let first = InboundOrder::receive("o1", "c1", raw("R-1", "std"), None, true, at(0)).unwrap();
        let (_, outcome) = book.receive(first.clone());
        assert_eq!(outcome, ReceiveOutcome::Created);

        // Same delivery again
        let (stored, outcome) = book.receive(first);
        assert_eq!(outcome, ReceiveOutcome::Unchanged);
        assert_eq!(stored.id, "o1");

        // Modified delivery while still pending
        let changed =
            InboundOrder::receive("o2", "c1", raw("R-1", "dlx"), None, true, at(5)).unwrap();
        let (stored, outcome) = book.receive(changed.clone());
        assert_eq!(outcome, ReceiveOutcome::Updated);
        assert_eq!(stored.id, "o1");
        assert_eq!(stored.payload().unwrap().room_type, "dlx");

        // Terminal orders ignore re-delivery
        let mut applied = stored;
        applied.mark_applied("res-1", at(6)).unwrap();
        book.update(applied);
        let (stored, outcome) = book.receive(
            InboundOrder::receive("o3", "c1", raw("R-1", "std"), None, true, at(7)).unwrap(),
        );
        assert_eq!(outcome, ReceiveOutcome::Unchanged);
        assert_eq!(stored.status, OrderStatus::Applied);
        assert!(book.pending().is_empty());
        assert!(book.get_by_id("o1").is_some());
    }
}
