//! Message-level I/O over a framed transport channel.

use eloquent_transport::BoxChannel;
use eloquent_wire::{EndpointMessage, Frame, FrameCodec, SessionMessage};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use crate::error::{Error, Result};

/// A transport channel speaking session and endpoint messages.
pub(crate) struct MessageChannel {
    framed: Framed<BoxChannel, FrameCodec>,
}

impl MessageChannel {
    pub fn new(stream: BoxChannel, max_frame_size: usize) -> Self {
        let codec = FrameCodec::new().with_max_frame_size(max_frame_size);
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    /// Write a standalone session message.
    pub async fn send(&mut self, message: &SessionMessage) -> Result<()> {
        self.framed.send(message.to_frame()).await?;
        Ok(())
    }

    /// Write a marker and its endpoint message back to back, flushing once.
    pub async fn send_pair(
        &mut self,
        marker: &SessionMessage,
        endpoint: &EndpointMessage,
    ) -> Result<()> {
        self.framed.feed(marker.to_frame()).await?;
        self.framed.feed(endpoint.to_frame()).await?;
        SinkExt::<Frame>::flush(&mut self.framed).await?;
        Ok(())
    }

    /// Read the next session message; `None` when the peer closed the stream.
    pub async fn receive(&mut self) -> Result<Option<SessionMessage>> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(SessionMessage::from_frame(frame?)?)),
            None => Ok(None),
        }
    }

    /// Read the endpoint message that follows a marker.
    pub async fn receive_endpoint(&mut self) -> Result<EndpointMessage> {
        match self.framed.next().await {
            Some(frame) => Ok(EndpointMessage::from_frame(frame?)?),
            None => Err(Error::Connection(
                "stream closed between a marker and its endpoint message".to_string(),
            )),
        }
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<Frame>::close(&mut self.framed).await?;
        Ok(())
    }
}
