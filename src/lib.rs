#![allow(warnings)]
#![cfg_attr(feature = "nightly", feature(backtrace))]

pub(crate) mod deps {
    pub use log;
    pub use nix;
    pub use parking_lot;
    pub use thiserror;
}

pub mod error;
pub mod config;
pub mod sid;

mod affinity;
mod arena;
mod freelist;
mod ctrl;
mod closelist;
mod swapfile;
mod io_engine;
mod pool;

pub use ctrl::CtrlId;
pub use error::{Error, Result};
pub use pool::Pool;
pub use sid::Sid;
