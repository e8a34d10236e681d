//! gamegrid-activity: last-activity bookkeeping for GameGrid VMs.
//!
//! Every session start and end touches the VM it runs on. The idle
//! reclaimer only stops VMs whose last touch is older than the idle
//! timeout, so a long session with bursty traffic could look idle between
//! touches. With `heartbeat_interval` configured, the tracker runs a
//! background task per active session that keeps touching its VM.
//!
//! # Architecture
//!
//! ```text
//! ActivityTracker
//!   ├── touch(vm_id) → Registry::touch_activity (monotonic)
//!   └── Per-session heartbeat task (optional)
//!       ├── tick every heartbeat_interval
//!       └── stops on unwatch(), stop_all(), or once the VM leaves Running
//! ```

pub mod tracker;

pub use tracker::ActivityTracker;
