mod core;
mod exponential;
mod retry;
mod same;

pub use self::core::*;
pub use exponential::*;
pub use retry::*;
pub use same::*;
