// error module
pub mod error;

// configuration module
pub mod config;

// data module
pub mod data {
    pub mod layers;
    pub mod stub;
    pub mod store;
}

// pattern module
pub mod pattern {
    pub mod golden;
    pub mod score;
    pub mod bank;
    pub mod stats;
    pub mod generator;
}

// algorithm module
pub mod algorithm {
    pub mod extrapolation;
    pub mod matcher;
    pub mod selector;
}

// Re-export commonly used types
pub use error::{Error, Result};
