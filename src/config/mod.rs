//! Configuration Module
//!
//! Connection profiles handed over by the shell.

pub mod profile;

pub use profile::ConnectionProfile;
