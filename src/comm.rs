//! # Communications Library
//!
//! The byte-level protocol spoken over a grain's host connection.  Every
//! message travels in a frame: a big-endian `u32` payload length followed by
//! the payload.  Payloads decode into [`message::Message`] values, which the
//! capability layer interprets.

pub mod frame;
pub mod message;

pub(crate) mod rwutil;
