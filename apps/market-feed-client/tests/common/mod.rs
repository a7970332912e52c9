//! Loopback feed server shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use market_feed_client::infrastructure::feed::{HeartbeatConfig, ReconnectConfig};
use market_feed_client::{ConnectionConfig, ConnectionManager};

/// Server-side socket of one accepted client connection.
pub type ServerSocket = WebSocketStream<TcpStream>;

/// Loopback WebSocket server handing every accepted connection to the test.
pub struct FeedServer {
    pub url: String,
    accepted: mpsc::UnboundedReceiver<ServerSocket>,
}

impl FeedServer {
    /// Bind on an ephemeral port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await
                    && tx.send(ws).is_err()
                {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{addr}"),
            accepted,
        }
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> ServerSocket {
        within(Duration::from_secs(5), self.accepted.recv())
            .await
            .expect("server channel closed")
    }

    /// Assert no client connects within `window`.
    pub async fn expect_no_connection(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.accepted.recv()).await;
        assert!(result.is_err(), "unexpected client connection");
    }
}

/// Connection config pointing at `url` with fast reconnects and no heartbeat.
pub fn fast_config(url: &str, max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig::new(url)
        .with_reconnect(ReconnectConfig::new(
            Duration::from_millis(20),
            max_attempts,
            0.0,
        ))
        .with_heartbeat(HeartbeatConfig::disabled())
}

/// Send one text frame.
pub async fn send_text(socket: &mut ServerSocket, text: &str) {
    socket.send(Message::Text(text.into())).await.unwrap();
}

/// A `marketData` frame.
pub fn tick_frame(symbol: &str, price: &str) -> String {
    format!(
        r#"{{"type":"marketData","data":{{"symbol":"{symbol}","price":{price},"bid":{price},"ask":{price},"volume":1000}}}}"#
    )
}

/// A `tradingStatus` frame.
pub fn status_frame(symbol: &str, status: &str) -> String {
    format!(r#"{{"type":"tradingStatus","data":{{"symbol":"{symbol}","status":"{status}"}}}}"#)
}

/// Await `future`, failing the test after `limit`.
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    tokio::time::timeout(limit, future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    within(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Wait until `manager` reports `Connected`.
pub async fn wait_connected(manager: &ConnectionManager) {
    eventually(|| manager.state() == market_feed_client::ConnectionState::Connected).await;
}
