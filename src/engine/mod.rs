//! Core engine: costs → scan → admit → execute → settle.

pub mod accountant;
pub mod classifier;
pub mod costs;
pub mod executor;
pub mod retry;
pub mod scanner;
pub mod scheduler;
