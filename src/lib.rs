//! Pay-in lifecycle, fee safety gate and chain strategy dispatch for a custodial
//! exchange backend.

pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
