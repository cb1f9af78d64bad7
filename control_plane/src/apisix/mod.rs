mod manifest;
mod types;

pub use manifest::Manifest;
pub use types::*;
