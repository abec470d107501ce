//! Integration tests driving the engine through its public API.

mod common;
mod pipeline;
mod replay;
