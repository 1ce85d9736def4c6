//! Leader-elected periodic scheduling (C11) and the daily billing and
//! AI-quota-reset sweep (C12).

pub mod billing;
pub mod leader;

pub use billing::{BillingBackend, BillingSweep};
pub use leader::{FanOut, LeaderConfig, LeaderScheduler};
