// Public API for integration tests and potential library usage

pub mod answer;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reconcile;
pub mod results;
pub mod session;
pub mod state;
pub mod submit;
pub mod types;
pub mod view;
pub mod ws;
