#![recursion_limit = "256"]

pub mod attack;
pub mod data;
pub mod meters;
pub mod model;
pub mod sam;
pub mod training;
pub mod utils;
