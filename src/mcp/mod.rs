//! Model Context Protocol (MCP) client side.
//!
//! Connects to stdio and streamable-HTTP MCP servers once at startup,
//! discovers their tools and merges them into one registry the agent can call.
//!
//! # Configuration
//!
//! MCP servers are configured via `mcp.json`:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "time": {
//!       "command": "uvx",
//!       "args": ["mcp-server-time"],
//!       "transport": "stdio"
//!     },
//!     "research": {
//!       "url": "https://example.invalid/mcp",
//!       "transport": "streamable_http",
//!       "headers": { "Authorization": "Bearer ${RESEARCH_TOKEN}" }
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Naming
//!
//! A tool keeps its own name unless two servers expose the same name; then
//! each colliding tool is exposed as `server__tool` (e.g. `research__search`).

pub mod config;
pub mod registry;
