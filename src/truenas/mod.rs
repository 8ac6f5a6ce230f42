pub mod backoff;
pub mod codec;
pub(crate) mod connection;
pub mod dispatcher;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;

pub use dispatcher::SubscriptionHandle;
pub use session::{CallOptions, TrueNasSession};
pub use state::{CloseReason, ConnectionState, StateChange};
