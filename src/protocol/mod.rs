//! Wire framing shared by every socket of a [`crate::Network`]

mod framing;

pub use framing::{Frame, Framing, LENGTH_PREFIX_SIZE};
