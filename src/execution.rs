// =============================================================================
// Order Execution Engine — transactional market-order booking
// =============================================================================
//
// Stateless: every execution borrows the store handle and receives the
// current replay price explicitly from the simulation engine. The whole
// procedure — pending insert, funds/holdings validation, both position
// deltas, order flip, trade append — runs in one transaction; a failure at
// any step rolls everything back, so a rejected order leaves no row behind.
//
// Fees are charged in the quote currency and realized against the cash
// position immediately; the base position's cost basis carries notional only.
// =============================================================================

use tracing::{info, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::persistence::models::{Order, Trade};
use crate::persistence::{orders, positions, Database};
use crate::types::{Side, FEE_RATE, QUOTE_CURRENCY};

/// Tolerance when comparing balances against required amounts.
const BALANCE_EPS: f64 = 1e-9;

/// Everything a successful execution produced, in emission order: the order
/// as it was first booked, the order after its fill, and the fill itself.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub placed: Order,
    pub order: Order,
    pub trade: Trade,
}

pub struct OrderExecutor {
    db: Database,
}

impl OrderExecutor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Execute a market order against the current replay price.
    ///
    /// Preconditions checked here: `quantity > 0`, `sim_price > 0`. The
    /// caller has already confirmed the simulation is running and that
    /// `symbol` is the session's symbol.
    #[instrument(skip(self), name = "execution::market")]
    pub async fn execute_market(
        &self,
        user_id: i64,
        simulation_id: i64,
        symbol: &str,
        side: Side,
        quantity: f64,
        sim_price: f64,
        sim_time: i64,
    ) -> CoreResult<ExecutionOutcome> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(CoreError::InvalidRequest(format!(
                "order quantity must be positive, got {quantity}"
            )));
        }
        if !sim_price.is_finite() || sim_price <= 0.0 {
            return Err(CoreError::InvalidRequest(format!(
                "no valid replay price, got {sim_price}"
            )));
        }

        let notional = quantity * sim_price;
        let fee = notional * FEE_RATE;
        let symbol = symbol.to_string();

        let outcome = self
            .db
            .with_tx(move |tx| {
                let placed = orders::insert_pending(
                    tx,
                    user_id,
                    simulation_id,
                    &symbol,
                    QUOTE_CURRENCY,
                    side,
                    quantity,
                    sim_time,
                )?;

                match side {
                    Side::Buy => {
                        let available = positions::get(tx, user_id, simulation_id, QUOTE_CURRENCY)?
                            .map_or(0.0, |p| p.quantity);
                        let required = notional + fee;
                        if available + BALANCE_EPS < required {
                            warn!(
                                simulation_id,
                                required, available, "buy rejected: insufficient funds"
                            );
                            return Err(CoreError::InsufficientFunds {
                                required,
                                available,
                            });
                        }

                        // Cash first, then the base asset.
                        positions::apply_delta(
                            tx,
                            user_id,
                            simulation_id,
                            QUOTE_CURRENCY,
                            QUOTE_CURRENCY,
                            -required,
                            1.0,
                        )?;
                        positions::apply_delta(
                            tx,
                            user_id,
                            simulation_id,
                            &symbol,
                            QUOTE_CURRENCY,
                            quantity,
                            sim_price,
                        )?;
                    }
                    Side::Sell => {
                        let available = positions::get(tx, user_id, simulation_id, &symbol)?
                            .map_or(0.0, |p| p.quantity);
                        if available + BALANCE_EPS < quantity {
                            warn!(
                                simulation_id,
                                required = quantity,
                                available,
                                "sell rejected: insufficient holdings"
                            );
                            return Err(CoreError::InsufficientHoldings {
                                required: quantity,
                                available,
                            });
                        }

                        positions::apply_delta(
                            tx,
                            user_id,
                            simulation_id,
                            QUOTE_CURRENCY,
                            QUOTE_CURRENCY,
                            notional - fee,
                            1.0,
                        )?;
                        positions::apply_delta(
                            tx,
                            user_id,
                            simulation_id,
                            &symbol,
                            QUOTE_CURRENCY,
                            -quantity,
                            sim_price,
                        )?;
                    }
                }

                orders::mark_executed(tx, placed.id, sim_time, sim_price, fee)?;
                let order = orders::get(tx, placed.id)?
                    .ok_or(CoreError::Persistence(rusqlite::Error::QueryReturnedNoRows))?;
                let trade = orders::insert_trade(tx, &order, sim_price, fee, sim_time)?;

                Ok(ExecutionOutcome {
                    placed,
                    order,
                    trade,
                })
            })
            .await?;

        info!(
            order_id = outcome.order.id,
            simulation_id,
            side = %side,
            quantity,
            price = sim_price,
            fee,
            "market order executed"
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::simulations;
    use crate::types::{OrderStatus, DEFAULT_USER_ID};

    const SIM_START: i64 = 1_724_738_400_000;
    const PRICE: f64 = 50_000.0;

    /// Fresh store with one running simulation funded with `funding` USDT.
    async fn setup(funding: f64) -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let sim = db
            .with_tx(move |tx| {
                let sim = simulations::create(
                    tx,
                    DEFAULT_USER_ID,
                    "BTCUSDT",
                    SIM_START,
                    funding,
                    "{}",
                    SIM_START,
                )?;
                positions::apply_delta(
                    tx,
                    DEFAULT_USER_ID,
                    sim.id,
                    QUOTE_CURRENCY,
                    QUOTE_CURRENCY,
                    funding,
                    1.0,
                )?;
                Ok(sim)
            })
            .await
            .unwrap();
        (db, sim.id)
    }

    async fn cash(db: &Database, sim: i64) -> f64 {
        db.with_conn(move |conn| positions::get(conn, DEFAULT_USER_ID, sim, QUOTE_CURRENCY))
            .await
            .unwrap()
            .map_or(0.0, |p| p.quantity)
    }

    #[tokio::test]
    async fn buy_books_order_trade_and_both_positions() {
        let (db, sim) = setup(10_000.0).await;
        let executor = OrderExecutor::new(db.clone());

        let outcome = executor
            .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Buy, 0.1, PRICE, SIM_START)
            .await
            .unwrap();

        assert_eq!(outcome.placed.status, OrderStatus::Pending);
        assert_eq!(outcome.order.status, OrderStatus::Executed);
        assert_eq!(outcome.order.executed_price, Some(PRICE));
        assert_eq!(outcome.trade.order_id, outcome.order.id);
        assert_eq!(outcome.trade.quantity, 0.1);
        assert_eq!(outcome.trade.fee, 0.1 * PRICE * FEE_RATE);

        let base = db
            .with_conn(move |conn| positions::get(conn, DEFAULT_USER_ID, sim, "BTCUSDT"))
            .await
            .unwrap()
            .unwrap();
        assert!((base.quantity - 0.1).abs() < 1e-12);
        assert!((base.average_price - PRICE).abs() < 1e-9);

        let expected_cash = 10_000.0 - 0.1 * PRICE - 0.1 * PRICE * FEE_RATE;
        assert!((cash(&db, sim).await - expected_cash).abs() < 1e-6);
    }

    #[tokio::test]
    async fn buy_then_sell_round_trip_realizes_both_fees() {
        let (db, sim) = setup(10_000.0).await;
        let executor = OrderExecutor::new(db.clone());

        executor
            .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Buy, 0.1, PRICE, SIM_START)
            .await
            .unwrap();
        executor
            .execute_market(
                DEFAULT_USER_ID,
                sim,
                "BTCUSDT",
                Side::Sell,
                0.1,
                PRICE,
                SIM_START + 60_000,
            )
            .await
            .unwrap();

        // Base position fully closed and deleted.
        let base = db
            .with_conn(move |conn| positions::get(conn, DEFAULT_USER_ID, sim, "BTCUSDT"))
            .await
            .unwrap();
        assert!(base.is_none());

        // Cash reflects both fees and nothing else at an unchanged price.
        let expected = 10_000.0 - 2.0 * (0.1 * PRICE * FEE_RATE);
        assert!((cash(&db, sim).await - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn funding_invariant_holds_while_holding() {
        let (db, sim) = setup(10_000.0).await;
        let executor = OrderExecutor::new(db.clone());

        let outcome = executor
            .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Buy, 0.05, PRICE, SIM_START)
            .await
            .unwrap();

        let total_cost: f64 = db
            .with_conn(move |conn| positions::list(conn, DEFAULT_USER_ID, Some(sim)))
            .await
            .unwrap()
            .iter()
            .map(|p| p.total_cost)
            .sum();

        let expected = 10_000.0 - outcome.trade.fee;
        assert!(
            ((total_cost - expected) / expected).abs() < 1e-6,
            "sum of total_cost {total_cost} vs {expected}"
        );
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_rows() {
        let (db, sim) = setup(100.0).await;
        let executor = OrderExecutor::new(db.clone());

        let err = executor
            .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Buy, 1.0, PRICE, SIM_START)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds { .. }));

        let order_rows = db
            .with_conn(move |conn| orders::list(conn, DEFAULT_USER_ID, Some(sim)))
            .await
            .unwrap();
        assert!(order_rows.is_empty());
        assert_eq!(cash(&db, sim).await, 100.0);
    }

    #[tokio::test]
    async fn insufficient_holdings_rejects_oversell() {
        let (db, sim) = setup(10_000.0).await;
        let executor = OrderExecutor::new(db.clone());

        executor
            .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Buy, 0.1, PRICE, SIM_START)
            .await
            .unwrap();

        let err = executor
            .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Sell, 0.2, PRICE, SIM_START)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientHoldings { .. }));

        // The failed sell left exactly one (executed) order behind.
        let order_rows = db
            .with_conn(move |conn| orders::list(conn, DEFAULT_USER_ID, Some(sim)))
            .await
            .unwrap();
        assert_eq!(order_rows.len(), 1);
        assert_eq!(order_rows[0].status, OrderStatus::Executed);
    }

    #[tokio::test]
    async fn rejects_non_positive_inputs() {
        let (db, sim) = setup(10_000.0).await;
        let executor = OrderExecutor::new(db);

        for (qty, price) in [(0.0, PRICE), (-1.0, PRICE), (1.0, 0.0), (1.0, -5.0)] {
            let err = executor
                .execute_market(DEFAULT_USER_ID, sim, "BTCUSDT", Side::Buy, qty, price, SIM_START)
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidRequest(_)));
        }
    }
}
