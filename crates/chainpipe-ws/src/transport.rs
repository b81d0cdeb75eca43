//! Frame-level transport: the seam between the client state machine and the
//! WebSocket library.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::endpoint::Endpoint;
use crate::error::StreamError;

/// Protocol-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = StreamError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, StreamError>> + Send>>;

/// Opens one duplex connection to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<(FrameSink, FrameStream), StreamError>;
}

/// [`Connector`] backed by `tokio-tungstenite` with rustls.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<(FrameSink, FrameStream), StreamError> {
        let url = endpoint.parsed_url()?;

        let ws = match &endpoint.proxy {
            None => {
                let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| StreamError::Connect(e.to_string()))?;
                ws
            }
            Some(proxy) => {
                let tunnel = open_tunnel(proxy, &url).await?;
                let (ws, _) = tokio_tungstenite::client_async_tls(url.as_str(), tunnel)
                    .await
                    .map_err(|e| StreamError::Connect(e.to_string()))?;
                ws
            }
        };

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| StreamError::Send(e.to_string()))
            .with(|frame: Frame| futures::future::ready(Ok::<_, StreamError>(to_message(frame))));
        let stream = stream.filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(m) => from_message(m).map(Ok),
                Err(e) => Some(Err(StreamError::Receive(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(t) => Message::Text(t.into()),
        Frame::Binary(b) => Message::Binary(b.into()),
        Frame::Ping(p) => Message::Ping(p.into()),
        Frame::Pong(p) => Message::Pong(p.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(msg: Message) -> Option<Frame> {
    match msg {
        Message::Text(t) => Some(Frame::Text(t.as_str().to_owned())),
        Message::Binary(b) => Some(Frame::Binary(b.to_vec())),
        Message::Ping(p) => Some(Frame::Ping(p.to_vec())),
        Message::Pong(p) => Some(Frame::Pong(p.to_vec())),
        Message::Close(_) => Some(Frame::Close),
        // Raw frames never surface when reading.
        _ => None,
    }
}

/// Open a TCP tunnel to `target` through an HTTP forward proxy.
async fn open_tunnel(proxy: &str, target: &Url) -> Result<TcpStream, StreamError> {
    let proxy_url = Url::parse(proxy).map_err(|e| StreamError::Proxy(e.to_string()))?;
    let proxy_host = proxy_url
        .host_str()
        .ok_or_else(|| StreamError::Proxy(format!("proxy '{proxy}' has no host")))?;
    let proxy_port = proxy_url.port_or_known_default().unwrap_or(8080);

    let host = target
        .host_str()
        .ok_or_else(|| StreamError::InvalidEndpoint("endpoint has no host".into()))?;
    let port = target.port_or_known_default().unwrap_or(443);
    let authority = format!("{host}:{port}");

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| StreamError::Proxy(e.to_string()))?;

    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| StreamError::Proxy(e.to_string()))?;

    // Read the response head byte by byte so no tunnel bytes are consumed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8 * 1024 {
            return Err(StreamError::Proxy("oversized CONNECT response".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| StreamError::Proxy(e.to_string()))?;
        if n == 0 {
            return Err(StreamError::Proxy("proxy closed during CONNECT".into()));
        }
        head.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status_line = status_line.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(StreamError::Proxy(format!("CONNECT rejected: {status_line}")));
    }

    tracing::debug!(proxy = %proxy_host, target = %authority, "proxy tunnel established");
    Ok(stream)
}
