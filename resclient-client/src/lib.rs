#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links)]

mod cache;
mod client;
mod diff;
mod errors;
mod events;
mod manager;
mod resource;
mod stale;
mod ws;

pub mod mock;

pub use cache::Factory;
pub use client::{OnConnect, ResClient, ResClientBuilder};
pub use errors::ClientError;
pub use events::{ClientEvent, EventBus, ListenerId, ResourceEvent};
pub use resource::{Collection, Model, Resource, ResourceError, ResourceKind, Value};
pub use ws::{BackendDriver, BackendHandle, Connector, WsConnector};

pub use futures_util::StreamExt;
