//! End-to-end suites: full cycles against the simulated venues.

mod admission;
mod harness;
mod lifecycle;
mod scenarios;
