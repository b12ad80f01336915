//! Execution engine for templated HTTP API test cases.
//!
//! A [`TestCase`] is a list of steps, each pointing at an [`ApiTemplate`].
//! The [`Orchestrator`] runs the enabled steps in order against one
//! [`VariableContext`]: values extracted from one response become
//! `${name}` substitutions in the next request.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod runner;
pub mod step;
pub mod store;
pub mod template;
pub mod validator;
pub mod variables;

pub use config::*;
pub use error::*;
pub use events::*;
pub use executor::{
    join_url, HttpResponse, ReqwestExecutor, RequestExecutor, ResolvedRequest,
};
pub use model::*;
pub use runner::*;
pub use store::*;
pub use variables::{SystemValue, VariableContext, VariableSnapshot};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
