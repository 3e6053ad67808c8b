//! Weekly commission settlement: calculate, scale, persist, finalize.

pub mod binary_commission;
pub mod calculator;
pub mod config;
pub mod demo;
pub mod direct_commission;
pub mod engine;
pub mod error;
pub mod event;
pub mod merkle;
pub mod merkle_settlement;
pub mod override_commission;
pub mod period;
pub mod pool_scaling;
pub mod run_lock;
pub mod safety_valve;
pub mod settlement;
pub mod snapshot;
pub mod store;
pub mod types;

pub use engine::{CalculationSummary, SettlementEngine};
pub use error::{CommissionError, CommissionResult, PartialComputeError};
pub use store::SettlementStore;
