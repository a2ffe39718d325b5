//! Worker process: command line, wiring of the production collaborators and
//! the supervised run loop.

pub mod app;
pub mod cli;
