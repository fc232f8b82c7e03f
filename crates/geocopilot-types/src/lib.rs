mod capability;
mod environment;
mod error;
mod event;
mod execution;
mod log;
mod message;

pub use capability::*;
pub use environment::*;
pub use error::*;
pub use event::*;
pub use execution::*;
pub use log::*;
pub use message::*;
