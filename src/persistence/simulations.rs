// =============================================================================
// Simulation DAO
// =============================================================================

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::persistence::models::Simulation;
use crate::types::SimulationStatus;

/// Insert a new simulation in `running` and return the stored row.
pub fn create(
    conn: &Connection,
    user_id: i64,
    symbol: &str,
    start_sim_time: i64,
    initial_funding: f64,
    extra_configs: &str,
    created_at: i64,
) -> CoreResult<Simulation> {
    conn.execute(
        "INSERT INTO simulations
         (user_id, symbol, start_sim_time, initial_funding, mode, extra_configs, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 'spot', ?5, ?6, ?7)",
        params![
            user_id,
            symbol,
            start_sim_time,
            initial_funding,
            extra_configs,
            SimulationStatus::Running.as_str(),
            created_at
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(simulation_id = id, symbol, start_sim_time, "simulation created");

    get(conn, id)?.ok_or(CoreError::SimulationNotFound(id))
}

pub fn get(conn: &Connection, id: i64) -> CoreResult<Option<Simulation>> {
    let mut stmt = conn.prepare_cached("SELECT * FROM simulations WHERE id = ?1")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(Simulation::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn list(conn: &Connection, user_id: i64) -> CoreResult<Vec<Simulation>> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM simulations WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let sims = stmt
        .query_map(params![user_id], Simulation::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sims)
}

pub fn set_status(conn: &Connection, id: i64, status: SimulationStatus) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE simulations SET status = ?2 WHERE id = ?1",
        params![id, status.as_str()],
    )?;
    if changed == 0 {
        return Err(CoreError::SimulationNotFound(id));
    }
    Ok(())
}

/// Replace the opaque session parameters (speed, timeframe).
pub fn update_extra_configs(conn: &Connection, id: i64, extra_configs: &str) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE simulations SET extra_configs = ?2 WHERE id = ?1",
        params![id, extra_configs],
    )?;
    if changed == 0 {
        return Err(CoreError::SimulationNotFound(id));
    }
    Ok(())
}

/// Terminal snapshot: status, end of simulated time, and portfolio value.
pub fn finish(
    conn: &Connection,
    id: i64,
    status: SimulationStatus,
    end_sim_time: i64,
    total_value: f64,
) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE simulations SET status = ?2, end_sim_time = ?3, total_value = ?4 WHERE id = ?1",
        params![id, status.as_str(), end_sim_time, total_value],
    )?;
    if changed == 0 {
        return Err(CoreError::SimulationNotFound(id));
    }
    info!(simulation_id = id, status = %status, end_sim_time, total_value, "simulation finished");
    Ok(())
}

/// Remove a simulation and every order, trade, and position that references
/// it. Must run inside a transaction so the cascade is all-or-nothing.
pub fn delete_cascade(conn: &Connection, id: i64) -> CoreResult<()> {
    conn.execute("DELETE FROM positions WHERE simulation_id = ?1", params![id])?;
    conn.execute("DELETE FROM trades WHERE simulation_id = ?1", params![id])?;
    conn.execute("DELETE FROM orders WHERE simulation_id = ?1", params![id])?;
    let changed = conn.execute("DELETE FROM simulations WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(CoreError::SimulationNotFound(id));
    }
    info!(simulation_id = id, "simulation purged");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
