//! Outbound write seam

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{ConversationError, Result};

/// Where the conversation engine writes outbound packets
///
/// Implementations must not block; queue the packet and let a writer task
/// (see [`Connection`](crate::transport::Connection)) do the IO. A returned
/// error is reported to the caller of the send.
pub trait WireSink<Pk>: Send + Sync + 'static {
    fn send_to_wire(&self, packet: Pk) -> Result<()>;
}

impl<Pk: Send + 'static> WireSink<Pk> for mpsc::UnboundedSender<Pk> {
    fn send_to_wire(&self, packet: Pk) -> Result<()> {
        self.send(packet)
            .map_err(|_| ConversationError::connection_closed("outbound queue closed"))
    }
}

impl<Pk: Send + 'static> WireSink<Pk> for mpsc::Sender<Pk> {
    fn send_to_wire(&self, packet: Pk) -> Result<()> {
        self.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConversationError::io("outbound queue full"),
            mpsc::error::TrySendError::Closed(_) => {
                ConversationError::connection_closed("outbound queue closed")
            },
        })
    }
}

impl<Pk, S: WireSink<Pk> + ?Sized> WireSink<Pk> for Arc<S> {
    fn send_to_wire(&self, packet: Pk) -> Result<()> {
        (**self).send_to_wire(packet)
    }
}
