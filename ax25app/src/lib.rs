#![doc = include_str!("../README.md")]

pub mod client;
pub mod connection;
pub mod controller;
pub mod error;
pub mod observer;
pub mod timer;
pub mod tnc;

#[cfg(test)]
mod test_util;

// Protocol definitions needed to build frames or implement observers
pub use ax25core::address::{Address, AddressField};
pub use ax25core::frame::{Ax25Frame, ControlField, Pid};
