// =============================================================================
// Order / Trade DAO
// =============================================================================
//
// Orders and trades are coupled: a trade row only ever exists as the fill of
// an executed order, written in the same transaction that flips the order
// out of `pending`.
// =============================================================================

use rusqlite::{params, Connection};

use crate::error::{CoreError, CoreResult};
use crate::persistence::models::{Order, Trade};
use crate::types::{OrderStatus, Side};

/// Insert a new order in `pending` and return the stored row.
pub fn insert_pending(
    conn: &Connection,
    user_id: i64,
    simulation_id: i64,
    symbol: &str,
    base_currency: &str,
    side: Side,
    quantity: f64,
    placed_at: i64,
) -> CoreResult<Order> {
    conn.execute(
        "INSERT INTO orders
         (user_id, simulation_id, symbol, base_currency, side, order_type, quantity, status, placed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'market', ?6, ?7, ?8)",
        params![
            user_id,
            simulation_id,
            symbol,
            base_currency,
            side.as_str(),
            quantity,
            OrderStatus::Pending.as_str(),
            placed_at
        ],
    )?;
    let id = conn.last_insert_rowid();
    get(conn, id)?.ok_or(CoreError::Persistence(rusqlite::Error::QueryReturnedNoRows))
}

/// Flip an order to `executed` with its fill details.
pub fn mark_executed(
    conn: &Connection,
    id: i64,
    executed_at: i64,
    executed_price: f64,
    fee: f64,
) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE orders
         SET status = ?2, executed_at = ?3, executed_price = ?4, fee = ?5
         WHERE id = ?1",
        params![id, OrderStatus::Executed.as_str(), executed_at, executed_price, fee],
    )?;
    if changed == 0 {
        return Err(CoreError::Persistence(rusqlite::Error::QueryReturnedNoRows));
    }
    Ok(())
}

pub fn get(conn: &Connection, id: i64) -> CoreResult<Option<Order>> {
    let mut stmt = conn.prepare_cached("SELECT * FROM orders WHERE id = ?1")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(Order::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list(
    conn: &Connection,
    user_id: i64,
    simulation_id: Option<i64>,
) -> CoreResult<Vec<Order>> {
    match simulation_id {
        Some(sim) => {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM orders WHERE user_id = ?1 AND simulation_id = ?2
                 ORDER BY placed_at ASC, id ASC",
            )?;
            let orders = stmt
                .query_map(params![user_id, sim], Order::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(orders)
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM orders WHERE user_id = ?1 ORDER BY placed_at ASC, id ASC",
            )?;
            let orders = stmt
                .query_map(params![user_id], Order::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(orders)
        }
    }
}

/// Append the fill mirroring an executed order.
pub fn insert_trade(
    conn: &Connection,
    order: &Order,
    price: f64,
    fee: f64,
    executed_at: i64,
) -> CoreResult<Trade> {
    conn.execute(
        "INSERT INTO trades
         (order_id, user_id, simulation_id, symbol, base_currency, side, quantity, price, fee, executed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            order.id,
            order.user_id,
            order.simulation_id,
            order.symbol,
            order.base_currency,
            order.side.as_str(),
            order.quantity,
            price,
            fee,
            executed_at
        ],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached("SELECT * FROM trades WHERE id = ?1")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Trade::from_row(row)?),
        None => Err(CoreError::Persistence(rusqlite::Error::QueryReturnedNoRows)),
    }
}

pub fn list_trades(
    conn: &Connection,
    user_id: i64,
    simulation_id: Option<i64>,
) -> CoreResult<Vec<Trade>> {
    match simulation_id {
        Some(sim) => {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM trades WHERE user_id = ?1 AND simulation_id = ?2
                 ORDER BY executed_at ASC, id ASC",
            )?;
            let trades = stmt
                .query_map(params![user_id, sim], Trade::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(trades)
        }
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM trades WHERE user_id = ?1 ORDER BY executed_at ASC, id ASC",
            )?;
            let trades = stmt
                .query_map(params![user_id], Trade::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(trades)
        }
    }
}

/// Aggregate counts and fee total for one simulation's activity.
pub fn activity_summary(conn: &Connection, simulation_id: i64) -> CoreResult<(i64, i64, f64)> {
    let order_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE simulation_id = ?1",
        params![simulation_id],
        |r| r.get(0),
    )?;
    let (trade_count, fee_total): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(fee), 0) FROM trades WHERE simulation_id = ?1",
        params![simulation_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok((order_count, trade_count, fee_total))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Database;
    use crate::types::{DEFAULT_USER_ID, QUOTE_CURRENCY};

    #[tokio::test]
    async fn pending_then_executed_lifecycle() {
        let db = Database::open_in_memory().unwrap();

        let order = db
            .with_tx(|tx| {
                insert_pending(
                    tx,
                    DEFAULT_USER_ID,
                    1,
                    "BTCUSDT",
                    QUOTE_CURRENCY,
                    Side::Buy,
                    0.1,
                    1_724_738_460_000,
                )
            })
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.order_type, "market");
        assert!(order.executed_at.is_none());

        db.with_conn(|conn| mark_executed(conn, order.id, 1_724_738_460_000, 50_000.0, 5.0))
            .await
            .unwrap();

        let executed = db
            .with_conn(|conn| get(conn, order.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(executed.status, OrderStatus::Executed);
        assert_eq!(executed.executed_price, Some(50_000.0));
        assert_eq!(executed.fee, 5.0);
    }

    #[tokio::test]
    async fn trade_mirrors_its_order() {
        let db = Database::open_in_memory().unwrap();

        let (order, trade) = db
            .with_tx(|tx| {
                let order = insert_pending(
                    tx,
                    DEFAULT_USER_ID,
                    7,
                    "ETHUSDT",
                    QUOTE_CURRENCY,
                    Side::Sell,
                    2.0,
                    1_000,
                )?;
                mark_executed(tx, order.id, 1_000, 2_500.0, 5.0)?;
                let trade = insert_trade(tx, &order, 2_500.0, 5.0, 1_000)?;
                Ok((order, trade))
            })
            .await
            .unwrap();

        assert_eq!(trade.order_id, order.id);
        assert_eq!(trade.quantity, order.quantity);
        assert_eq!(trade.price, 2_500.0);
        assert_eq!(trade.side, Side::Sell);

        let (orders, trades, fees) = db
            .with_conn(|conn| activity_summary(conn, 7))
            .await
            .unwrap();
        assert_eq!((orders, trades), (1, 1));
        assert_eq!(fees, 5.0);
    }

    #[tokio::test]
    async fn listings_filter_by_simulation() {
        let db = Database::open_in_memory().unwrap();

        db.with_tx(|tx| {
            for sim in [1_i64, 1, 2] {
                insert_pending(
                    tx,
                    DEFAULT_USER_ID,
                    sim,
                    "BTCUSDT",
                    QUOTE_CURRENCY,
                    Side::Buy,
                    1.0,
                    sim * 10,
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let all = db
            .with_conn(|conn| list(conn, DEFAULT_USER_ID, None))
            .await
            .unwrap();
        let sim1 = db
            .with_conn(|conn| list(conn, DEFAULT_USER_ID, Some(1)))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(sim1.len(), 2);
    }
}
