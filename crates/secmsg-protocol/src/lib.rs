//! Wire protocol for the secmsg messaging core: the envelope byte
//! layout, the proof-of-work admission gate, the ECIES encryption
//! pipeline, and the codecs for the `smsg*` overlay commands.
//!
//! Everything in this crate is wire-fixed. Peers running different
//! constants or check orders will not reconcile, so changes here are
//! network-splitting by definition.

pub mod constants;
pub mod encrypt;
pub mod envelope;
pub mod pow;
pub mod wire;

pub use constants::*;
pub use envelope::{MessageHeader, SecureMessage};
