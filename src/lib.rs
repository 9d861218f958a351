#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # RES-Client protocol library.
//!
//! A client for the RES protocol as served by [Resgate]-style gateways: a
//! JSON message protocol over a single WebSocket connection synchronizing
//! live, reference-linked resources between server and client.
//!
//! ## Quickstart: `prelude`
//!
//! A prelude is provided which imports the important types and traits:
//!
//! ```no_run
//! # #[allow(unused)]
//! use resclient::prelude::*;
//! ```
//!
//! # Modules in ascending order of abstraction
//!
//! ## `core`
//!
//! Protocol-level data structures: [resource identifiers](core::Rid) and
//! glob [patterns](core::Pattern), [wire frames](core::ServerMessage), and
//! the [error object](core::ResError) carried by error responses. No I/O.
//!
//! ## `client`
//!
//! The live client. [`ResClient`](client::ResClient) multiplexes
//! subscriptions and method calls over one WebSocket, materializes server
//! snapshots into a cache of shared [`Resource`](client::Resource)
//! handles, applies pushed events to keep the local graph consistent, and
//! recovers subscriptions across disconnects.
//!
//! [Resgate]: https://resgate.io

pub use resclient_client as client;
pub use resclient_core as core;

/// Easy imports of the commonly used types.
pub mod prelude {
    pub use super::{client::*, core::*};
}
