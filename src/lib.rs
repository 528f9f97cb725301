//! # repo2md
//!
//! Clone a repository (or upload an archive) into a per-session sandbox,
//! pick files by directory and extension, and export them as a single
//! Markdown document ready to paste into an LLM conversation.
//!
//! ## Usage
//!
//! ```bash
//! repo2md [-v] serve [--config repo2md.toml] [--root .repos] [--port 8000]
//! repo2md clean [--root .repos]
//! ```
//!
//! ## Modules
//!
//! - `config` - Server configuration from TOML, environment and CLI flags
//! - `explorer` - Directory tree and extension inventory of a checkout
//! - `export` - File selection and Markdown rendering
//! - `server` - axum HTTP routes and the WebSocket heartbeat channel
//! - `subprocess` - Unified subprocess abstraction layer for testing
//! - `workspace` - Session sandboxes, registry, population and liveness
pub mod config;
pub mod explorer;
pub mod export;
pub mod server;
pub mod subprocess;
pub mod workspace;
