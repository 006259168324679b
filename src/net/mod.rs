//! Networking layer: dual-stack sockets plus the wire protocol built on top.

pub mod socket;

pub use socket::{ConnectedSocket, ConnectingSocket, ListeningSocket};
