pub mod scripted;
pub mod simulated;

pub use scripted::{ScriptedExchange, ScriptedExchangeFactory};
pub use simulated::{SimulatedExchange, SimulatedExchangeConfig, SimulatedExchangeFactory};
