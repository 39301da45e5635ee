pub mod error;
pub mod framing;
pub mod hooks;
pub mod node;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod rpc;
pub mod types;
pub mod wg;

pub use error::{Error, Result};
pub use types::{ConnectionInfo, Endpoint, Node};
