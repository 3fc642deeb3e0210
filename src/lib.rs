//! `PixelJack` - screen-driven game automation
//!
//! Watches screen regions for template images and colour markers, runs
//! click sequences when a trigger appears, alerts when a marker shows up,
//! and taps keys on a randomised timer. Every engine runs in its own
//! single-owner control loop; see [`scheduler`].

pub mod alert;
pub mod cli;
pub mod config;
pub mod error;
pub mod keys;
pub mod notify;
pub mod observability;
pub mod phase;
pub mod platform;
pub mod runtime;
pub mod scheduler;
pub mod vision;
