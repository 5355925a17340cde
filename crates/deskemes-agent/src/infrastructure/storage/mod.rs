//! Storage infrastructure: configuration and trust store persistence.
//!
//! - **`config`** – reads and writes the agent's TOML configuration file from
//!   the platform-appropriate directory, generating the device's public ID on
//!   first run.
//!
//! - **`trust_store`** – remembers every desktop this device has started
//!   pairing with, the key pair generated for it, and whether a human
//!   approved it.  Persisted as a second TOML file next to the config.

pub mod config;
pub mod trust_store;
