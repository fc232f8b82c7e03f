pub mod aggregator;
pub mod cancellation;
pub mod capability;
pub mod config;
pub mod conversation;
pub mod datasource;
pub mod edit_session;
pub mod engine_loop;
pub mod environment;
pub mod event_bus;
pub mod history;
pub mod preflight;
pub mod process_runtime;
pub mod retry;
pub mod runtime;
pub mod sandbox;
pub mod screening;
pub mod workspace;

pub use aggregator::*;
pub use cancellation::*;
pub use capability::*;
pub use config::*;
pub use conversation::*;
pub use datasource::*;
pub use edit_session::*;
pub use engine_loop::*;
pub use environment::*;
pub use event_bus::*;
pub use history::*;
pub use preflight::*;
pub use process_runtime::*;
pub use retry::*;
pub use runtime::*;
pub use sandbox::*;
pub use screening::*;
pub use workspace::*;
