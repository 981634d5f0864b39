//! The line protocol: command decoding, responses, discovery and the
//! dispatcher that ties them to the session registry.

pub mod command;
pub mod discovery;
pub mod dispatcher;
pub mod protocol;
