//! axum `WebSocket` adapter.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use super::{Frame, FrameSink, FrameSource, TransportError};

/// Write half of an upgraded socket.
pub struct WsSink(SplitSink<WebSocket, Message>);

/// Read half of an upgraded socket.
pub struct WsSource(SplitStream<WebSocket>);

/// Split an upgraded socket into transport halves.
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (tx, rx) = socket.split();
    (WsSink(tx), WsSource(rx))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.0
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        match self.0.next().await? {
            Ok(message) => Some(Ok(from_message(message))),
            Err(e) => Some(Err(TransportError::Io(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn text_frame_maps_to_text_message() {
        let msg = to_message(Frame::Text("hello".into()));
        assert!(matches!(msg, Message::Text(ref t) if t.as_str() == "hello"));
    }

    #[test]
    fn close_frame_maps_to_close_without_reason() {
        assert!(matches!(to_message(Frame::Close), Message::Close(None)));
    }

    #[test]
    fn inbound_messages_map_back() {
        assert_eq!(
            from_message(Message::Text("hi".into())),
            Frame::Text("hi".into())
        );
        assert_eq!(
            from_message(Message::Binary(Bytes::from_static(b"\x01"))),
            Frame::Binary(Bytes::from_static(b"\x01"))
        );
        assert_eq!(from_message(Message::Close(None)), Frame::Close);
        assert_eq!(
            from_message(Message::Pong(Bytes::new())),
            Frame::Pong(Bytes::new())
        );
    }
}
