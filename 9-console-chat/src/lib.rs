//! Line-oriented terminal chat: one server relaying text to every connected
//! user, and a client that edits input and repaints messages on the same
//! terminal.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`protocol`] holds the wire text and the newline-delimited
//!   [`protocol::LineChannel`].
//! - [`registry`] maps usernames to outbound channels and fans out
//!   broadcasts, dropping recipients whose writes fail.
//! - [`server`] accepts TCP connections and runs one
//!   [`server::ConnectionSession`] per connection.
//! - [`terminal`], [`store`], and [`input`] are the client's screen, message
//!   history, and line editor.
//! - [`client`] ties them to a server connection.

pub mod cli;
pub mod client;
pub mod input;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod terminal;
