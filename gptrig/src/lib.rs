// src/lib.rs
pub mod error;

pub mod data {
    pub mod patterns;
    pub mod factors;
    pub mod events;
    pub mod raw;
    pub mod candidates;
}

pub mod sim {
    pub mod muon;
}

pub mod run {
    pub mod settings;
    pub mod emulator;
}

pub use error::{Result, RunError};
