//! Integration tests for poolwatch-bot.
//!
//! These tests verify the interaction between components:
//! - Event source to monitor loop to dispatcher to checkpoint
//! - Crash recovery and alert dedup
//! - End-to-end runs over HTTP JSON-RPC and the Bot API

pub mod common;
