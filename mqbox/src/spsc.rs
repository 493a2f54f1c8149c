//! Single-producer single-consumer ring primitives.
//!
//! The ring algorithm here is shared-memory agnostic: [`crate::mailbox`] places
//! a [`ring::RingState`] and its slots inside a named mapping and serializes
//! each role within the process.

pub(crate) mod ring;
