// =============================================================================
// Position DAO — signed holdings with directional-cost arithmetic
// =============================================================================
//
// The update rule is the part of the books that is easy to get wrong:
//
//   * quote-currency rows (symbol == "USDT") pin average_price to 1 and
//     total_cost to quantity — they ARE the cash balance;
//   * same-direction additions accumulate cost and re-derive the average;
//   * opposite-direction partial closes retain the average and re-derive
//     total_cost from it — fees never enter the remaining cost basis, they
//     are realized against the cash position by the caller's quote-side
//     delta;
//   * a row that reaches zero quantity is deleted, never stored.
// =============================================================================

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::persistence::models::Position;
use crate::types::QUOTE_CURRENCY;

/// Quantities below this are treated as a fully closed position.
const ZERO_EPS: f64 = 1e-9;

pub fn get(
    conn: &Connection,
    user_id: i64,
    simulation_id: i64,
    symbol: &str,
) -> CoreResult<Option<Position>> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM positions WHERE user_id = ?1 AND simulation_id = ?2 AND symbol = ?3",
    )?;
    let mut rows = stmt.query(params![user_id, simulation_id, symbol])?;
    match rows.next()? {
        Some(row) => Ok(Some(Position::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list(
    conn: &Connection,
    user_id: i64,
    simulation_id: Option<i64>,
) -> CoreResult<Vec<Position>> {
    match simulation_id {
        Some(sim) => {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM positions WHERE user_id = ?1 AND simulation_id = ?2
                 ORDER BY symbol ASC",
            )?;
            let positions = stmt
                .query_map(params![user_id, sim], Position::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(positions)
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM positions WHERE user_id = ?1 ORDER BY simulation_id ASC, symbol ASC",
            )?;
            let positions = stmt
                .query_map(params![user_id], Position::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(positions)
        }
    }
}

/// Apply a signed quantity delta at `price` to the `(user, simulation,
/// symbol)` position, creating, updating, or deleting the row per the cost
/// rules above.
pub fn apply_delta(
    conn: &Connection,
    user_id: i64,
    simulation_id: i64,
    symbol: &str,
    base_currency: &str,
    delta_qty: f64,
    price: f64,
) -> CoreResult<()> {
    if delta_qty == 0.0 {
        return Ok(());
    }

    let existing = get(conn, user_id, simulation_id, symbol)?;

    let (new_qty, new_avg, new_cost) = match &existing {
        None => {
            if symbol == QUOTE_CURRENCY {
                (delta_qty, 1.0, delta_qty)
            } else {
                (delta_qty, price, delta_qty * price)
            }
        }
        Some(pos) => {
            let new_qty = pos.quantity + delta_qty;
            if new_qty.abs() < ZERO_EPS {
                let changed = conn.execute(
                    "DELETE FROM positions
                     WHERE user_id = ?1 AND simulation_id = ?2 AND symbol = ?3",
                    params![user_id, simulation_id, symbol],
                )?;
                if changed == 0 {
                    return Err(CoreError::Persistence(rusqlite::Error::QueryReturnedNoRows));
                }
                debug!(user_id, simulation_id, symbol, "position closed and deleted");
                return Ok(());
            }

            if symbol == QUOTE_CURRENCY {
                (new_qty, 1.0, new_qty)
            } else if pos.quantity.signum() == delta_qty.signum() {
                // Same-direction addition: accumulate cost, re-derive average.
                let new_cost = pos.total_cost + delta_qty * price;
                (new_qty, new_cost / new_qty, new_cost)
            } else {
                // Partial close: average survives, cost shrinks with quantity.
                (new_qty, pos.average_price, pos.average_price * new_qty)
            }
        }
    };

    match existing {
        None => {
            conn.execute(
                "INSERT INTO positions
                 (user_id, simulation_id, symbol, base_currency, quantity, average_price, total_cost)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![user_id, simulation_id, symbol, base_currency, new_qty, new_avg, new_cost],
            )?;
        }
        Some(_) => {
            conn.execute(
                "UPDATE positions
                 SET quantity = ?4, average_price = ?5, total_cost = ?6
                 WHERE user_id = ?1 AND simulation_id = ?2 AND symbol = ?3",
                params![user_id, simulation_id, symbol, new_qty, new_avg, new_cost],
            )?;
        }
    }

    debug!(
        user_id,
        simulation_id,
        symbol,
        delta_qty,
        price,
        new_qty,
        new_avg,
        new_cost,
        "position updated"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Database;
    use crate::types::DEFAULT_USER_ID;

    const SIM: i64 = 1;

    async fn apply(db: &Database, symbol: &str, delta: f64, price: f64) {
        let symbol = symbol.to_string();
        db.with_tx(move |tx| {
            apply_delta(
                tx,
                DEFAULT_USER_ID,
                SIM,
                &symbol,
                QUOTE_CURRENCY,
                delta,
                price,
            )
        })
        .await
        .unwrap()
    }

    async fn fetch(db: &Database, symbol: &str) -> Option<Position> {
        let symbol = symbol.to_string();
        db.with_conn(move |conn| get(conn, DEFAULT_USER_ID, SIM, &symbol))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn quote_position_pins_average_and_cost() {
        let db = Database::open_in_memory().unwrap();

        apply(&db, QUOTE_CURRENCY, 10_000.0, 1.0).await;
        let cash = fetch(&db, QUOTE_CURRENCY).await.unwrap();
        assert_eq!(cash.quantity, 10_000.0);
        assert_eq!(cash.average_price, 1.0);
        assert_eq!(cash.total_cost, 10_000.0);

        apply(&db, QUOTE_CURRENCY, -2_500.0, 1.0).await;
        let cash = fetch(&db, QUOTE_CURRENCY).await.unwrap();
        assert_eq!(cash.quantity, 7_500.0);
        assert_eq!(cash.average_price, 1.0);
        assert_eq!(cash.total_cost, 7_500.0);
    }

    #[tokio::test]
    async fn same_direction_addition_re_derives_average() {
        let db = Database::open_in_memory().unwrap();

        apply(&db, "BTCUSDT", 1.0, 50_000.0).await;
        apply(&db, "BTCUSDT", 1.0, 60_000.0).await;

        let pos = fetch(&db, "BTCUSDT").await.unwrap();
        assert_eq!(pos.quantity, 2.0);
        assert_eq!(pos.total_cost, 110_000.0);
        assert_eq!(pos.average_price, 55_000.0);
    }

    #[tokio::test]
    async fn partial_close_retains_average_price() {
        let db = Database::open_in_memory().unwrap();

        apply(&db, "BTCUSDT", 2.0, 50_000.0).await;
        // Sell half at a very different price — basis must not move.
        apply(&db, "BTCUSDT", -1.0, 80_000.0).await;

        let pos = fetch(&db, "BTCUSDT").await.unwrap();
        assert_eq!(pos.quantity, 1.0);
        assert_eq!(pos.average_price, 50_000.0);
        assert_eq!(pos.total_cost, 50_000.0);
    }

    #[tokio::test]
    async fn full_close_deletes_the_row() {
        let db = Database::open_in_memory().unwrap();

        apply(&db, "ETHUSDT", 0.5, 2_000.0).await;
        apply(&db, "ETHUSDT", -0.5, 2_100.0).await;
        assert!(fetch(&db, "ETHUSDT").await.is_none());
    }

    #[tokio::test]
    async fn zero_delta_is_a_no_op() {
        let db = Database::open_in_memory().unwrap();
        apply(&db, "BTCUSDT", 0.0, 50_000.0).await;
        assert!(fetch(&db, "BTCUSDT").await.is_none());
    }
}
