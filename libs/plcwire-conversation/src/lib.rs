//! plcwire conversation engine
//!
//! Correlates outbound requests with inbound responses for industrial
//! protocol drivers (Modbus, ADS, S7, ...). Protocol logic declares what it
//! expects with a builder chain; the dispatcher routes every decoded packet to
//! at most one waiting registration, and a per-context timer fails the ones
//! nobody answered.
//!
//! # Example
//! ```ignore
//! let (tx, outbound) = tokio::sync::mpsc::unbounded_channel();
//! let (ctx, dispatcher) = ConversationContext::<AdsProtocol>::new(ConversationConfig::default(), tx)?;
//! let connection = Connection::spawn(stream, AdsCodec::default(), ctx.clone(), dispatcher, outbound);
//!
//! let invoke_id = ctx.next_key();
//! ctx.send_request(AmsPacket::read_state(invoke_id))
//!     .expect_response::<AmsPacket>(Duration::from_secs(2))
//!     .unwrap(|packet| packet.payload)
//!     .on_timeout(|err| warn!("{}", err))
//!     .handle(|payload| {
//!         info!("state: {:?}", payload);
//!         Ok(())
//!     })?;
//! ```

pub mod builder;
pub mod config;
pub mod context;
mod correlation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registration;
mod registry;
mod scheduler;
pub mod sink;
pub mod stats;
pub mod transaction;
pub mod transport;

#[cfg(test)]
mod testing;

pub use builder::{ConversationBuilder, ExpectRequestBuilder, SendRequestBuilder, Unexpected};
pub use config::ConversationConfig;
pub use context::ConversationContext;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{ConversationError, Result, WiringError};
pub use events::{ConnectionEvent, DiscoveryInfo};
pub use protocol::{CorrelationKey, KeyGenerator, Protocol};
pub use registration::{CancelHandle, Outcome, RegistrationHandle, RegistrationId, RegistrationState};
pub use sink::WireSink;
pub use stats::{ConversationStats, ConversationStatsSnapshot};
pub use transaction::{RequestTransaction, RequestTransactionManager};
pub use transport::Connection;
