#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links)]

mod rid;
pub use rid::{InvalidPattern, Pattern, Rid};

mod error;
pub use error::{codes, ResError};

mod message;
pub use message::{DataValue, Request, ResourceSet, ServerMessage};
