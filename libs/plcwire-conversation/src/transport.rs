//! Stream transport adapter
//!
//! Binds a conversation context to any `AsyncRead + AsyncWrite` through a
//! `tokio_util` codec. Two tasks per connection:
//!
//! - writer: drains the outbound queue in submission order
//! - reader: the only inbound path; decodes and dispatches packet by packet
//!
//! When the stream ends or fails, the reader emits `Disconnected`, marks the
//! context disconnected and fails every pending registration with the cause.

use std::fmt::Display;
use std::sync::{Arc, Weak};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info};

use crate::config::ConversationConfig;
use crate::context::{ConversationContext, Shared};
use crate::dispatcher::Dispatcher;
use crate::error::{ConversationError, Result};
use crate::protocol::Protocol;

/// Running connection: reader and writer tasks around one context
pub struct Connection<P: Protocol> {
    context: ConversationContext<P>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    reader_joined: bool,
}

impl<P: Protocol> Connection<P> {
    /// Spawn the reader and writer tasks
    ///
    /// `outbound` must be the receiving end of the sink the context was
    /// created with. Configure the dispatcher's unsolicited handling before
    /// passing it in.
    pub fn spawn<IO, C>(
        io: IO,
        codec: C,
        context: ConversationContext<P>,
        dispatcher: Dispatcher<P>,
        outbound: mpsc::UnboundedReceiver<P::Packet>,
    ) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        C: Decoder<Item = P::Packet> + Encoder<P::Packet> + Send + 'static,
        <C as Decoder>::Error: Display + Send,
        <C as Encoder<P::Packet>>::Error: Display + Send,
    {
        let (sink, stream) = Framed::new(io, codec).split::<P::Packet>();
        let writer = tokio::spawn(write_loop::<P, _>(
            sink,
            outbound,
            Arc::downgrade(&context.shared),
        ));
        let reader = tokio::spawn(read_loop(stream, context.clone(), dispatcher));
        info!("{} connection started", P::NAME);
        Self {
            context,
            reader,
            writer,
            reader_joined: false,
        }
    }

    /// Create a context for `io` and spawn the connection
    ///
    /// Returns the connection and the channel of unsolicited packets.
    pub fn open<IO, C>(
        io: IO,
        codec: C,
        config: ConversationConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<P::Packet>)>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        C: Decoder<Item = P::Packet> + Encoder<P::Packet> + Send + 'static,
        <C as Decoder>::Error: Display + Send,
        <C as Encoder<P::Packet>>::Error: Display + Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (context, mut dispatcher) = ConversationContext::new(config, tx)?;
        let unsolicited = dispatcher.unsolicited_channel();
        Ok((Self::spawn(io, codec, context, dispatcher, rx), unsolicited))
    }

    pub fn context(&self) -> &ConversationContext<P> {
        &self.context
    }

    /// Check if the reader has stopped (peer gone or shut down)
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Wait until the peer closes the stream or it fails
    pub async fn closed(&mut self) {
        if !self.reader_joined {
            let _ = (&mut self.reader).await;
            self.reader_joined = true;
        }
    }

    /// Close the context and stop both tasks
    pub fn shutdown(self) {
        self.context.close();
        self.reader.abort();
        self.writer.abort();
        info!("{} connection shut down", P::NAME);
    }
}

async fn write_loop<P, S>(
    sink: S,
    mut outbound: mpsc::UnboundedReceiver<P::Packet>,
    shared: Weak<Shared<P>>,
) where
    P: Protocol,
    S: Sink<P::Packet>,
    S::Error: Display,
{
    let mut sink = std::pin::pin!(sink);
    while let Some(packet) = outbound.recv().await {
        if let Err(e) = sink.send(packet).await {
            error!("{} write failed: {}", P::NAME, e);
            // The context owns the outbound sender, so hold it only weakly here
            if let Some(shared) = shared.upgrade() {
                ConversationContext { shared }.disconnect(ConversationError::io(e.to_string()));
            }
            break;
        }
    }
    let _ = sink.close().await;
    debug!("{} writer stopped", P::NAME);
}

async fn read_loop<P, St, E>(
    stream: St,
    context: ConversationContext<P>,
    mut dispatcher: Dispatcher<P>,
) where
    P: Protocol,
    St: Stream<Item = std::result::Result<P::Packet, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    context.fire_connected();

    let cause = loop {
        match stream.next().await {
            Some(Ok(packet)) => {
                dispatcher.dispatch(packet);
            },
            Some(Err(e)) => {
                error!("{} read failed: {}", P::NAME, e);
                break ConversationError::io(e.to_string());
            },
            None => {
                info!("{} peer closed the connection", P::NAME);
                break ConversationError::connection_closed("peer closed the connection");
            },
        }
    };

    context.fire_disconnected();
    context.disconnect(cause);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::events::ConnectionEvent;
    use crate::registration::Outcome;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio_util::codec::LinesCodec;

    /// Line protocol: every line is a packet, no correlation keys
    struct LineProtocol;

    impl Protocol for LineProtocol {
        type Packet = String;
        type Key = u32;
        const NAME: &'static str = "lines";
    }

    #[tokio::test]
    async fn test_request_and_response_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (connection, _unsolicited) =
            Connection::<LineProtocol>::open(client, LinesCodec::new(), ConversationConfig::default())
                .unwrap();

        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let request = lines.next_line().await.unwrap().unwrap();
            write
                .write_all(format!("echo {}\n", request).as_bytes())
                .await
                .unwrap();
        });

        let response = connection
            .context()
            .send_request("ping".to_string())
            .expect_response::<String>(Duration::from_secs(1))
            .check(|line| line.starts_with("echo"))
            .response()
            .await
            .unwrap();
        assert_eq!(response, "echo ping");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let (client, server) = tokio::io::duplex(1024);
        let (connection, _unsolicited) =
            Connection::<LineProtocol>::open(client, LinesCodec::new(), ConversationConfig::default())
                .unwrap();
        let mut events = connection.context().subscribe();

        let handle = connection
            .context()
            .expect_request::<String>(Duration::from_secs(5))
            .handle(|_| Ok(()))
            .unwrap();

        drop(server);
        match handle.completion().await {
            Outcome::Errored(err) => assert!(err.is_connection_lost()),
            other => panic!("unexpected outcome {:?}", other),
        }

        // Connected may or may not have been observed before subscribing
        let mut saw_disconnect = false;
        while let Ok(event) = events.recv().await {
            if event == ConnectionEvent::Disconnected {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
        assert!(connection.context().pending_count() == 0);

        // A dead connection rejects new work instead of letting it time out
        assert!(connection.context().is_disconnected());
        let late = connection
            .context()
            .expect_request::<String>(Duration::from_secs(5))
            .handle(|_| Ok(()));
        assert!(matches!(late, Err(ConversationError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_unmatched_lines_are_unsolicited() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (connection, mut unsolicited) =
            Connection::<LineProtocol>::open(client, LinesCodec::new(), ConversationConfig::default())
                .unwrap();

        server.write_all(b"alarm 42\n").await.unwrap();
        assert_eq!(unsolicited.recv().await.unwrap(), "alarm 42");
        connection.shutdown();
    }
}
