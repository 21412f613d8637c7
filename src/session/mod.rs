//! Session and conversation thread management.
//!
//! This module provides in-memory session storage for chat conversations.
//! Sessions are identified by UUID (or a client-chosen id) and contain the
//! visible user/assistant history.
//!
//! # Architecture
//!
//! - [`Session`]: Represents a single conversation session
//! - [`SessionStore`]: Thread-safe store for all active sessions
//!
//! # Example
//!
//! ```rust
//! use gemini_mcp_chat::session::SessionStore;
//!
//! let store = SessionStore::new();
//! let session = store.create();
//! session.commit_turn("Hello!", "Hi, how can I help?");
//!
//! let messages = session.messages();
//! assert_eq!(messages.len(), 2);
//! ```

mod thread;

pub use thread::{Session, SessionStore};
