//! Contract bindings for the external chain

pub mod bridge;
