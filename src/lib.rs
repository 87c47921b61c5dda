#![deny(rust_2018_idioms)]

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate smallvec;

#[cfg(test)]
#[macro_use]
pub mod test_utils;

#[macro_use]
mod macros;

pub mod error;
pub mod hash;
pub mod merge;
pub mod obj;
pub mod odb;
pub mod path;
pub mod xdiff;

mod interner;
