//! Session capture and replay.
//!
//! # Overview
//!
//! A session is stored as a recording: one `mcp-in`/`mcp-out` line per
//! message, in the order the messages crossed the wire.
//! 1. **recording** – entry types and the line codec
//! 2. **recorder** – tee a live stream (or a proxied server) into a recording
//! 3. **replayer** – re-send the inbound side, optionally as a dry run
//!
//! Verification against a live server lives in `crate::verify`.

pub mod recording;
pub mod recorder;
pub mod replayer;
