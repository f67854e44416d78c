pub mod config;
pub mod error;
pub mod session;

pub use config::Config;
pub use error::{Result, ToolError};
pub use session::{FsckReport, Session};

// Re-export the workspace crates
pub use rafs;
pub use system;
