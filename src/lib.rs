//! KISS/AX.25 packet terminal and APRS gateway.
//!
//! The crate drives a KISS TNC over one of three carriers (serial tty,
//! KISS-over-TCP, or a BLE handheld with an embedded TNC), decodes the AX.25
//! traffic on the channel, tracks every station heard, delivers APRS messages
//! with retries and acknowledgments, optionally digipeats, and re-exports the
//! radio to third-party clients over a raw KISS bridge, an AGWPE emulator,
//! and a JSON/SSE web API.

pub mod api;
pub mod aprs;
pub mod ax25;
pub mod bridge;
pub mod config;
pub mod digipeater;
pub mod engine;
pub mod events;
pub mod framebuf;
pub mod kiss;
pub mod messages;
pub mod scheduler;
pub mod station;
pub mod transport;
