//! Network infrastructure for the phone agent.
//!
//! Architecture:
//! - `beacon_listener` runs a std thread that parses UDP beacons and hands
//!   them to a [`beacon_listener::BeaconConsumer`], usually through the
//!   address blacklist filter.
//! - `manager` owns every TCP connection on one tokio task and decides
//!   which beacons are worth dialing.
//! - `connection` is the sans-IO handshake state machine for one desktop.
//! - `mux` is the channel table used once a connection is encrypted.

pub mod beacon_listener;
pub mod connection;
pub mod manager;
pub mod mux;
