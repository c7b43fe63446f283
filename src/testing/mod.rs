//! Testing utilities and mock implementations
//!
//! Lets the session manager, gateway and HTTP layer be exercised without a
//! running broker.

pub mod mocks;

pub use mocks::*;
