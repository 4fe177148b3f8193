//! Rust SDK for a text-to-image generation service.
//!
//! The crate is organized by transport surface:
//! - `stream`: websocket generation sessions with progress callbacks.
//! - `api`: HTTP client for model management and one-shot generation.
//! - `auth`: access token providers shared by both surfaces.
//! - `retry`: shared retry and timeout utilities.

/// Generation REST API client and request/response types.
pub mod api;
/// Access token providers.
pub mod auth;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Streaming generation client, protocol types, and session lifecycle.
pub mod stream;
