//! Database operations for inbound_orders, guests and reservations.

use chrono::NaiveDate;
use innsync_engine::{Guest, InboundOrder, OrderResult, OrderStatus, Reservation, Timestamp};
use sqlx::{PgConnection, Row};

/// A stored inbound order row from the database.
#[derive(Debug)]
pub struct StoredOrder {
    pub id: String,
    pub connection_id: String,
    pub external_id: String,
    pub channel_code: String,
    pub signature_valid: bool,
    pub signature: Option<String>,
    pub raw_payload: String,
    pub status: String,
    pub received_at: Timestamp,
    pub processed_at: Option<Timestamp>,
    pub result: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredOrder {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredOrder {
            id: row.try_get("id")?,
            connection_id: row.try_get("connection_id")?,
            external_id: row.try_get("external_id")?,
            channel_code: row.try_get("channel_code")?,
            signature_valid: row.try_get("signature_valid")?,
            signature: row.try_get("signature")?,
            raw_payload: row.try_get("raw_payload")?,
            status: row.try_get("status")?,
            received_at: row.try_get("received_at")?,
            processed_at: row.try_get("processed_at")?,
            result: row.try_get("result")?,
        })
    }
}

impl StoredOrder {
    /// Convert database row to an engine InboundOrder.
    pub fn to_order(self) -> Result<InboundOrder, String> {
        let status: OrderStatus = self.status.parse().map_err(|e| format!("{e}"))?;
        let result: Option<OrderResult> = self
            .result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("Invalid order result: {e}"))?;

        Ok(InboundOrder {
            id: self.id,
            connection_id: self.connection_id,
            external_id: self.external_id,
            channel_code: self.channel_code,
            signature_valid: self.signature_valid,
            signature: self.signature,
            raw_payload: self.raw_payload,
            status,
            received_at: self.received_at,
            processed_at: self.processed_at,
            result,
        })
    }
}

const ORDER_COLUMNS: &str = r#"
    id, connection_id, external_id, channel_code, signature_valid, signature,
    raw_payload, status, received_at, processed_at, result
"#;

pub async fn get_order(conn: &mut PgConnection, id: &str) -> Result<Option<StoredOrder>, sqlx::Error> {
    sqlx::query_as::<_, StoredOrder>(&format!(
        "SELECT {ORDER_COLUMNS} FROM inbound_orders WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

/// Lock and fetch an order by external id.
pub async fn get_order_by_external_id_for_update(
    conn: &mut PgConnection,
    external_id: &str,
) -> Result<Option<StoredOrder>, sqlx::Error> {
    sqlx::query_as::<_, StoredOrder>(&format!(
        "SELECT {ORDER_COLUMNS} FROM inbound_orders WHERE external_id = $1 FOR UPDATE"
    ))
    .bind(external_id)
    .fetch_optional(conn)
    .await
}

/// Insert an order, or overwrite the stored one with the same external id.
pub async fn upsert_order(conn: &mut PgConnection, order: &InboundOrder) -> Result<(), sqlx::Error> {
    let result = order
        .result
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO inbound_orders (
            id, connection_id, external_id, channel_code, signature_valid, signature,
            raw_payload, status, received_at, processed_at, result
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (external_id) DO UPDATE SET
            signature_valid = EXCLUDED.signature_valid,
            signature = EXCLUDED.signature,
            raw_payload = EXCLUDED.raw_payload,
            status = EXCLUDED.status,
            received_at = EXCLUDED.received_at,
            processed_at = EXCLUDED.processed_at,
            result = EXCLUDED.result
        "#,
    )
    .bind(&order.id)
    .bind(&order.connection_id)
    .bind(&order.external_id)
    .bind(&order.channel_code)
    .bind(order.signature_valid)
    .bind(&order.signature)
    .bind(&order.raw_payload)
    .bind(order.status.as_str())
    .bind(order.received_at)
    .bind(order.processed_at)
    .bind(result)
    .execute(conn)
    .await?;

    Ok(())
}

/// Insert a guest or merge into the one with the same property and email.
///
/// Returns the id of the stored guest.
pub async fn upsert_guest(conn: &mut PgConnection, guest: &Guest) -> Result<String, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO guests (id, property_id, email, first_name, last_name, phone)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (property_id, email) DO UPDATE SET
            first_name = EXCLUDED.first_name,
            last_name = EXCLUDED.last_name,
            phone = COALESCE(EXCLUDED.phone, guests.phone)
        RETURNING id
        "#,
    )
    .bind(&guest.id)
    .bind(&guest.property_id)
    .bind(&guest.email)
    .bind(&guest.first_name)
    .bind(&guest.last_name)
    .bind(&guest.phone)
    .fetch_one(conn)
    .await?;

    row.try_get("id")
}

/// Insert a reservation or update the one with the same external id.
///
/// Returns the id of the stored reservation.
pub async fn upsert_reservation(
    conn: &mut PgConnection,
    reservation: &Reservation,
) -> Result<String, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO reservations (
            id, external_id, property_id, guest_id, room_type, rate_plan,
            arrival, departure, rooms, total_amount, currency
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (external_id) DO UPDATE SET
            guest_id = EXCLUDED.guest_id,
            room_type = EXCLUDED.room_type,
            rate_plan = EXCLUDED.rate_plan,
            arrival = EXCLUDED.arrival,
            departure = EXCLUDED.departure,
            rooms = EXCLUDED.rooms,
            total_amount = EXCLUDED.total_amount,
            currency = EXCLUDED.currency
        RETURNING id
        "#,
    )
    .bind(&reservation.id)
    .bind(&reservation.external_id)
    .bind(&reservation.property_id)
    .bind(&reservation.guest_id)
    .bind(&reservation.room_type)
    .bind(&reservation.rate_plan)
    .bind(reservation.arrival)
    .bind(reservation.departure)
    .bind(reservation.rooms.min(i32::MAX as u32) as i32)
    .bind(reservation.total_amount)
    .bind(&reservation.currency)
    .fetch_one(conn)
    .await?;

    row.try_get("id")
}

pub async fn get_reservation(
    conn: &mut PgConnection,
    external_id: &str,
) -> Result<Option<Reservation>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, external_id, property_id, guest_id, room_type, rate_plan,
               arrival, departure, rooms, total_amount, currency
        FROM reservations
        WHERE external_id = $1
        "#,
    )
    .bind(external_id)
    .fetch_optional(conn)
    .await?;

    row.map(|row| {
        Ok(Reservation {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            property_id: row.try_get("property_id")?,
            guest_id: row.try_get("guest_id")?,
            room_type: row.try_get("room_type")?,
            rate_plan: row.try_get("rate_plan")?,
            arrival: row.try_get::<NaiveDate, _>("arrival")?,
            departure: row.try_get::<NaiveDate, _>("departure")?,
            rooms: row.try_get::<i32, _>("rooms")?.max(0) as u32,
            total_amount: row.try_get("total_amount")?,
            currency: row.try_get("currency")?,
        })
    })
    .transpose()
}

pub async fn count_reservations(conn: &mut PgConnection) -> Result<i64, sqlx::Error> {
    let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reservations")
        .fetch_one(conn)
        .await?;

    Ok(result.0)
}
