//! Event model & codec, filter & matcher.

pub mod codec;
pub mod event;
pub mod filter;
pub mod kind;
pub mod matcher;

pub use event::Event;
pub use filter::Filter;
pub use kind::{classify, KindClass};
