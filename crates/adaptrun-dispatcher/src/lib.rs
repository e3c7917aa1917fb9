//! adaptrun dispatcher: turns an asynchronous "adapt this file" request
//! into one bounded unit of ephemeral compute and reports the outcome back
//! to the requester.

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod launcher;
pub mod reply;
pub mod transfer;
