//! Hardware definitions shared by the Intel 10GbE drivers.
//!
//! Only the descriptor formats live here; register maps are device-specific
//! and are kept in each driver crate.

#![no_std]

extern crate bit_field;
extern crate zerocopy;
#[macro_use] extern crate static_assertions;

pub mod descriptors;
