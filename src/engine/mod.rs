//! Core engine: adaptive state ownership, settlement and the event feed.

pub mod accountant;
pub mod feed;
pub mod state;
