//! Service layer: the message bus, event broadcaster, orchestrator,
//! monitor bridge, and result poller.
//!
//! The bus owns outbound request correlation and inbound dispatch; the
//! broadcaster fans events out to the peer and to local subscribers; the
//! orchestrator wires the RPC catalogue to storage and session state; the
//! poller drives the waiting side of the handoff until results land.

pub mod broadcast;
pub mod bus;
pub mod monitor;
pub mod orchestrator;
pub mod poller;

pub use broadcast::{EventBroadcaster, HandlerId};
pub use bus::{MessageBus, PeerSink, RequestHandler};
pub use monitor::{MonitorAlert, MonitorBridge, MonitorEvent};
pub use orchestrator::QHealthService;
pub use poller::{PollState, ResultPoller, ResultsSource, RpcSource, StoreSource};
