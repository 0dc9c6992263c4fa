//! Outbound socket creation
//!
//! - [`Dialer`]: trait used by flow handlers
//! - [`DirectDialer`]: real sockets pinned to an interface

pub mod direct;
pub mod traits;

pub use direct::{bind_to_interface, DirectDialer, INTERFACE_MAX_LEN};
pub use traits::{Dialer, OutboundConnection};
