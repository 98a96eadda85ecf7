//! # PLE DAQ Core Library
//!
//! Synchronized excitation-scan acquisition over independent instrument daemons:
//! a tunable excitation source, a camera and an optional power meter. The daemons
//! only answer `trigger`, `is busy`, `fetch` and `configuration`, so every state
//! change is found by polling.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The scheduler. Poll-until-ready, scan plans, and the three
//!   routines (power monitor, tuning curve, excitation spectrum) with their dark
//!   references.
//! - **`config`**: Figment-based configuration (`config/ple_daq.toml` + `PLE_DAQ_` env).
//! - **`data`**: Dataset types and the sinks that persist them.
//! - **`error`**: The `DaqError` enum for failures that abort an acquisition.
//! - **`hardware`**: Device capability traits and simulated instruments.
//! - **`metadata`**: Provenance attached to every dataset.
//! - **`operator`**: Prompts for steps that need a person at the bench.
//! - **`orchestrator`**: Serializes acquisitions and hands results to persistence.
//! - **`tracing_init`**: Logging setup.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod metadata;
pub mod operator;
pub mod orchestrator;
pub mod tracing_init;
