//! Trading policy: risk tiers, blackout windows and admission control.

pub mod blackout;
pub mod governor;
pub mod risk;
