//! # Hedge Engine
//!
//! Opens and closes hedged positions across crypto derivatives exchanges:
//! a long leg on one exchange paired with a short leg on another.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Streaming sessions, connection health, REST adapters and
//!   per-exchange connectors with their order, position and fill books
//! - `strategy`: Hedge opportunities, the two-leg coordinator and
//!   single-order intents
//! - `engine`: Wiring, intent intake, periodic ticks and shutdown
//! - `error`: Error types shared across modules
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod strategy;
pub mod utils;

pub use config::Config;
