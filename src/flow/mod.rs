//! Flow lifecycle
//!
//! Each intercepted TCP connection or UDP association becomes a flow. The
//! [`FlowManager`] admits it under a concurrency limit and spawns a
//! [`FlowHandler`], which walks the [`FlowState`] machine:
//!
//! 1. **Matching**: the destination (IP and optional hostname) is matched
//!    against the current rule snapshot
//! 2. **Connecting**: the outbound socket is bound to the selected
//!    interface, falling back to the default route when it is unusable
//! 3. **Relaying**: bytes or datagrams are copied in both directions
//! 4. **Closing/Closed**: resources are dropped and the completion fires
//!    exactly once with a [`FlowOutcome`]

mod handler;
mod manager;
mod state;
mod stats;
mod types;
mod udp;

pub use handler::{CompletionFn, FlowContext, FlowHandler, FlowSettings};
pub use manager::{FlowHandle, FlowManager};
pub use state::FlowState;
pub use stats::{FlowStats, StatsSnapshot};
pub use types::{
    BoxedStream, Datagram, DatagramFlow, FlowMeta, FlowOutcome, FlowStatus, FlowStream,
    InboundFlow, Protocol,
};
pub use udp::MAX_DATAGRAM_SIZE;

#[cfg(test)]
pub(crate) use handler::tests as test_support;
