#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod api;
pub mod client;
pub mod metrics;
pub mod timeout;
pub mod wait;


pub use self::{
    metrics::WaitMetrics,
    wait::{InflightMode, WaitConfig, WaitServer},
};
