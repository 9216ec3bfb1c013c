pub mod buffer;
pub mod clock;
pub mod engine;

pub use buffer::ReplayBuffer;
pub use clock::SessionClock;
pub use engine::{EventSink, SimulationEngine};
