//! Protocol module for parsing request lines and encoding responses

pub mod command;
pub mod parser;

pub use command::{Command, GetKey, Response, StoreHeader};
pub use parser::Parser;
