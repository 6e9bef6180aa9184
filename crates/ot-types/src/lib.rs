pub mod errors;
pub mod params;
pub mod sample;

pub use errors::*;
pub use params::*;
pub use sample::*;
