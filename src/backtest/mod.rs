//! Offline evaluation: historical replay and per-source calibration.

pub mod calibration;
pub mod runner;
