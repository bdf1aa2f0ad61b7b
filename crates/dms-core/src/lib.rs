pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod history;
pub mod mail;
pub mod marker;
pub mod paths;
pub mod switch;
pub mod template;

#[cfg(test)]
mod fakes;

pub use error::{DmsError, Result};
