//! Portico - LAN gateway for a local LLM runtime
//!
//! This library provides the core functionality for fronting a locally-running
//! OpenAI-compatible runtime with authentication, transparent request
//! augmentation, programmatic model lifecycle control, and a live debug
//! event stream published over SSE.

pub mod access;
pub mod api;
pub mod bus;
pub mod cli;
pub mod config;
pub mod control;
pub mod logging;
pub mod proxy;
pub mod state;
pub mod tailer;
