pub mod db;
pub mod models;
pub mod orders;
pub mod positions;
pub mod simulations;

pub use db::Database;
pub use models::{Order, Position, Simulation, Trade};
