//! # ptftp roots
//!
//! Maps a TFTP client's IPv4 address to the directory it is allowed to read
//! from. The server consults a [`RootRegistry`] once per accepted request,
//! first with the client's own address and then with [`DEFAULT_CLIENT`].

pub mod error;
pub mod registry;

pub use error::{Result, RootsError};
pub use registry::{DEFAULT_CLIENT, FileRootRegistry, RootRegistry, StaticRootRegistry};
