//! Database operations for the ari_committed and ari_staged tables.

use chrono::NaiveDate;
use innsync_engine::{AriCell, CellKey, Timestamp};
use sqlx::{PgConnection, Row};

/// Which ARI table to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AriTable {
    Committed,
    Staged,
}

impl AriTable {
    fn name(self) -> &'static str {
        match self {
            AriTable::Committed => "ari_committed",
            AriTable::Staged => "ari_staged",
        }
    }
}

/// A stored ARI row.
#[derive(Debug)]
pub struct StoredCell {
    pub date: NaiveDate,
    pub room_type: String,
    pub rate_plan: String,
    pub rate: i64,
    pub available: i32,
    pub min_stay: Option<i16>,
    pub max_stay: Option<i16>,
    pub closed_to_arrival: bool,
    pub closed_to_departure: bool,
    pub stop_sell: bool,
    pub overridden: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredCell {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredCell {
            date: row.try_get("date")?,
            room_type: row.try_get("room_type")?,
            rate_plan: row.try_get("rate_plan")?,
            rate: row.try_get("rate")?,
            available: row.try_get("available")?,
            min_stay: row.try_get("min_stay")?,
            max_stay: row.try_get("max_stay")?,
            closed_to_arrival: row.try_get("closed_to_arrival")?,
            closed_to_departure: row.try_get("closed_to_departure")?,
            stop_sell: row.try_get("stop_sell")?,
            overridden: row.try_get("overridden")?,
        })
    }
}

impl StoredCell {
    pub fn into_entry(self) -> (CellKey, AriCell) {
        (
            CellKey::new(self.date, self.room_type, self.rate_plan),
            AriCell {
                rate: self.rate,
                available: self.available.max(0) as u32,
                min_stay: self.min_stay.map(|v| v.max(0) as u16),
                max_stay: self.max_stay.map(|v| v.max(0) as u16),
                closed_to_arrival: self.closed_to_arrival,
                closed_to_departure: self.closed_to_departure,
                stop_sell: self.stop_sell,
                overridden: self.overridden,
            },
        )
    }
}

/// Split keys into parallel column arrays for `UNNEST`.
fn key_columns(keys: &[CellKey]) -> (Vec<NaiveDate>, Vec<String>, Vec<String>) {
    let mut dates = Vec::with_capacity(keys.len());
    let mut room_types = Vec::with_capacity(keys.len());
    let mut rate_plans = Vec::with_capacity(keys.len());
    for key in keys {
        dates.push(key.date);
        room_types.push(key.room_type.clone());
        rate_plans.push(key.rate_plan.clone());
    }
    (dates, room_types, rate_plans)
}

/// Fetch rows for the given keys.
///
/// `for_update` locks the rows until the surrounding transaction ends.
pub async fn fetch_cells(
    conn: &mut PgConnection,
    table: AriTable,
    keys: &[CellKey],
    for_update: bool,
) -> Result<Vec<(CellKey, AriCell)>, sqlx::Error> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let (dates, room_types, rate_plans) = key_columns(keys);
    let sql = format!(
        r#"
        SELECT date, room_type, rate_plan, rate, available, min_stay, max_stay,
               closed_to_arrival, closed_to_departure, stop_sell, overridden
        FROM {table}
        WHERE (date, room_type, rate_plan) IN (
            SELECT * FROM UNNEST($1::date[], $2::text[], $3::text[])
        )
        {lock}
        "#,
        table = table.name(),
        lock = if for_update { "FOR UPDATE" } else { "" },
    );

    let rows = sqlx::query_as::<_, StoredCell>(&sql)
        .bind(dates)
        .bind(room_types)
        .bind(rate_plans)
        .fetch_all(conn)
        .await?;

    Ok(rows.into_iter().map(StoredCell::into_entry).collect())
}

pub async fn upsert_committed(
    conn: &mut PgConnection,
    key: &CellKey,
    cell: &AriCell,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ari_committed (
            date, room_type, rate_plan, rate, available, min_stay, max_stay,
            closed_to_arrival, closed_to_departure, stop_sell, overridden
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (date, room_type, rate_plan) DO UPDATE SET
            rate = EXCLUDED.rate,
            available = EXCLUDED.available,
            min_stay = EXCLUDED.min_stay,
            max_stay = EXCLUDED.max_stay,
            closed_to_arrival = EXCLUDED.closed_to_arrival,
            closed_to_departure = EXCLUDED.closed_to_departure,
            stop_sell = EXCLUDED.stop_sell,
            overridden = EXCLUDED.overridden,
            updated_at = NOW()
        "#,
    )
    .bind(key.date)
    .bind(&key.room_type)
    .bind(&key.rate_plan)
    .bind(cell.rate)
    .bind(cell.available.min(i32::MAX as u32) as i32)
    .bind(cell.min_stay.map(|v| v.min(i16::MAX as u16) as i16))
    .bind(cell.max_stay.map(|v| v.min(i16::MAX as u16) as i16))
    .bind(cell.closed_to_arrival)
    .bind(cell.closed_to_departure)
    .bind(cell.stop_sell)
    .bind(cell.overridden)
    .execute(conn)
    .await?;

    Ok(())
}

/// Stage a cell, replacing any earlier staged value.
pub async fn upsert_staged(
    conn: &mut PgConnection,
    key: &CellKey,
    cell: &AriCell,
    staged_at: Timestamp,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ari_staged (
            date, room_type, rate_plan, rate, available, min_stay, max_stay,
            closed_to_arrival, closed_to_departure, stop_sell, overridden, staged_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (date, room_type, rate_plan) DO UPDATE SET
            rate = EXCLUDED.rate,
            available = EXCLUDED.available,
            min_stay = EXCLUDED.min_stay,
            max_stay = EXCLUDED.max_stay,
            closed_to_arrival = EXCLUDED.closed_to_arrival,
            closed_to_departure = EXCLUDED.closed_to_departure,
            stop_sell = EXCLUDED.stop_sell,
            overridden = EXCLUDED.overridden,
            staged_at = EXCLUDED.staged_at
        "#,
    )
    .bind(key.date)
    .bind(&key.room_type)
    .bind(&key.rate_plan)
    .bind(cell.rate)
    .bind(cell.available.min(i32::MAX as u32) as i32)
    .bind(cell.min_stay.map(|v| v.min(i16::MAX as u16) as i16))
    .bind(cell.max_stay.map(|v| v.min(i16::MAX as u16) as i16))
    .bind(cell.closed_to_arrival)
    .bind(cell.closed_to_departure)
    .bind(cell.stop_sell)
    .bind(cell.overridden)
    .bind(staged_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn delete_staged(conn: &mut PgConnection, keys: &[CellKey]) -> Result<u64, sqlx::Error> {
    if keys.is_empty() {
        return Ok(0);
    }
    let (dates, room_types, rate_plans) = key_columns(keys);
    let result = sqlx::query(
        r#"
        DELETE FROM ari_staged
        WHERE (date, room_type, rate_plan) IN (
            SELECT * FROM UNNEST($1::date[], $2::text[], $3::text[])
        )
        "#,
    )
    .bind(dates)
    .bind(room_types)
    .bind(rate_plans)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn staged_keys(conn: &mut PgConnection) -> Result<Vec<CellKey>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT date, room_type, rate_plan
        FROM ari_staged
        ORDER BY date, room_type, rate_plan
        "#,
    )
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(CellKey::new(
                row.try_get::<NaiveDate, _>("date")?,
                row.try_get::<String, _>("room_type")?,
                row.try_get::<String, _>("rate_plan")?,
            ))
        })
        .collect()
}
