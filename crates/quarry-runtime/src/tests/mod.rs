//! Test modules for quarry-runtime

pub mod bridge_test;
