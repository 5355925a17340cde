//! Domain types shared by the handshake and the pairing workflow.
//!
//! - [`identity`] – the opaque public identifier a device advertises.
//! - [`thumbprint`] – the random-art picture shown to the user while pairing.

pub mod identity;
pub mod thumbprint;
