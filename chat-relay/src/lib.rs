//! Presence-and-broadcast chat over two TCP channels.
//!
//! Many short-lived clients connect to one relay. A client heartbeats to
//! announce liveness, talks publicly or to one handle, and receives roster
//! snapshots plus asynchronous broadcasts. Each module covers one
//! responsibility:
//!
//! - [`cli`] parses the command-line interface for relay and client modes.
//! - [`wire`] defines the binary framing constants, JSON payload bodies,
//!   and message builders of the chat protocol.
//! - [`message`] classifies inbound frame sequences into typed client and
//!   server messages.
//! - [`transport`] carries multipart byte frames over TCP in the four
//!   roles the protocol needs: identity-routing responder, identified
//!   requester, publisher, and prefix-filtered subscriber.
//! - [`registry`] tracks membership leases on the relay.
//! - [`relay`] runs the relay loop: purge expired leases, serve one
//!   request, broadcast join/leave news.
//! - [`session`] runs the client-side loop, multiplexing heartbeats and
//!   talks against roster and broadcast traffic.
//! - [`client`] renders a session in a terminal.
//!
//! Integration tests use this crate directly to exercise the relay state
//! machine and the wire protocol.

pub mod cli;
pub mod client;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;
pub mod wire;
