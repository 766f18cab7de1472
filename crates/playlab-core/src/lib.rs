//! PlayLab Core - Domain types, structure detectors, and the simulated exchange.
//!
//! This crate provides:
//! - Bar and OHLCV data types with timeframe labels
//! - O(1) sliding-window primitives (monotonic deque, ring buffer)
//! - Incremental market-structure detectors composed via a dependency arena
//! - Per-timeframe and multi-timeframe state containers
//! - The rationalization layer (transitions, derived state, regime)
//! - The Play document model and rule expression AST
//! - A Bybit-aligned simulated exchange for USDT linear perpetuals

pub mod bar;
pub mod detectors;
pub mod error;
pub mod play;
pub mod prices;
pub mod primitives;
pub mod rationalize;
pub mod registry;
pub mod sim;
pub mod state;

pub use bar::{Bar, BarData, IndicatorMap};
pub use error::{CoreError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bar::{Bar, BarData, IndicatorMap};
    pub use crate::detectors::{Detector, DetectorSpec, OutputValue};
    pub use crate::error::{CoreError, Result};
    pub use crate::play::Play;
    pub use crate::rationalize::{RationalizedState, StateRationalizer, Transition};
    pub use crate::registry::Registry;
    pub use crate::sim::exchange::SimulatedExchange;
    pub use crate::state::{MultiTfState, TfState};
}
