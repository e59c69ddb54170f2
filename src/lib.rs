// src/lib.rs — streamcap library root

pub mod collector;
pub mod infra;
pub mod protocol;
pub mod status;
pub mod store;
