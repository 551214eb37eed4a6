//! # FDAS Engine Core Library
//!
//! This crate is the core library for the `fdas-engine` application: the
//! run-sequencing and packet-conversion engine of a multi-chassis data
//! acquisition instrument (up to 32 chassis of 32 channels each). It is
//! organized as a library so the same logic serves the standalone binary,
//! the test suite, and any future site-specific control-bus frontend.
//!
//! ## Crate Structure
//!
//! - **`bus`**: The [`bus::ControlBus`] trait over the control system's
//!   publish/subscribe session, the value types that cross it, and the
//!   in-memory `MockBus` used for testing.
//! - **`cache`**: The readiness cache mirroring every monitored remote value,
//!   with a single wake-all change notification.
//! - **`cleaner`**: Retention for the capture spool directories; evicts the
//!   oldest files per glob pattern once a quota is exceeded.
//! - **`codec`**: The capture-packet decoder. Turns a chassis's `.dat`
//!   stream into per-channel artifacts, synthesizing samples over gaps.
//! - **`config`**: `Settings` loaded from TOML over built-in defaults.
//! - **`convert`**: The per-chassis conversion fan-out: parallel decode on
//!   blocking workers, artifact relocation and final header rewrite.
//! - **`error`**: The crate-wide [`error::EngineError`] enum.
//! - **`header`**: The JSON run header document, written in preliminary and
//!   final forms.
//! - **`sequence`**: The run sequencer: readiness mirroring, operator
//!   commands, and the full acquisition life cycle.
//! - **`signals`**: Signal addressing and remote-value naming.

pub mod bus;
pub mod cache;
pub mod cleaner;
pub mod codec;
pub mod config;
pub mod convert;
pub mod error;
pub mod header;
pub mod sequence;
pub mod signals;
