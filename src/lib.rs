//! # Live Translate Backend
//!
//! Relay server between microphone capture clients and a cloud speech
//! recognition service. A client holds one WebSocket connection per
//! recording, streams raw PCM over it, and receives transcription events
//! back on the same socket. A small REST surface provides a degraded-mode
//! transcription endpoint for clients that cannot keep a streaming
//! connection open, plus health, metrics, and runtime configuration.
//!
//! ## Module layout
//! - **protocol**: JSON wire messages exchanged with capture clients
//! - **websocket**: one actor per connection; frames in, events out
//! - **session**: per-connection state machine driving the engine binding
//! - **engine**: speech provider seam plus the Azure implementation
//! - **languages**: client language codes to service locale resolution
//! - **client**: capture-side protocol client and ordered transport fallback
//! - **handlers / health / middleware**: REST surface and request plumbing

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod languages;
pub mod middleware;
pub mod protocol;
pub mod session;
pub mod state;
pub mod websocket;
