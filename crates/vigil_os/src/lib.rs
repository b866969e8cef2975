#![forbid(unsafe_code)]

pub mod guard;
