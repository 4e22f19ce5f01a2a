pub mod alert;
pub mod config;
pub mod error;
pub mod rule;
pub mod telemetry;

pub use alert::*;
pub use config::Config;
pub use error::*;
pub use rule::*;
pub use telemetry::*;
