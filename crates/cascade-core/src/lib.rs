pub mod catalog;
pub mod classification;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod hooks;
pub mod traits;
pub mod types;

pub use catalog::{Capability, RoleCatalog, RoleDefinition};
pub use config::AppConfig;
pub use context::{ContextSection, IsolatedRoleContext, Section};
pub use error::{CascadeError, Result};
pub use event::EventBus;
pub use types::*;
