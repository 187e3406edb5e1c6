//! # lode-common
//!
//! Common types, errors, and configuration shared by every lode crate.
//!
//! - **Errors**: [`LodeError`] and the protocol-level [`ErrorKind`] taxonomy
//! - **Types**: [`HandleId`] and [`CursorId`] identifiers
//! - **Config**: open/read/write options, store identity, registry and
//!   engine settings, and the toml-loadable [`LodeConfig`]
//! - **Constants**: defaults and limits
//!
//! ## Example
//!
//! ```rust
//! use lode_common::{OpenOptions, StoreIdentity};
//!
//! let options = OpenOptions::default().with_block_size(8192);
//! let identity = StoreIdentity::new("/tmp/store", options);
//! assert_eq!(identity.options().block_size, 8192);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{
    EngineConfig, LodeConfig, OpenMode, OpenOptions, ReadOptions, RegistryConfig, StoreIdentity,
    WriteOptions,
};
pub use constants::*;
pub use error::{ErrorKind, LodeError, LodeResult};
pub use types::{CursorId, HandleId};
