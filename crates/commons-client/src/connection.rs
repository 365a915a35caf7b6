use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use commons_types::events::{GatewayCommand, GatewayFrame};

use crate::error::{ClientError, ClientResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live gateway connection. Owned by whoever drives it; opening a second
/// one is just another value, not shared global state.
pub struct GatewayConnection {
    user_id: Uuid,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl GatewayConnection {
    /// Connect to `{base_url}/gateway` and wait for `ready`.
    pub async fn open(base_url: &str, token: &str) -> ClientResult<Self> {
        let ws_url = format!(
            "{}/gateway?token={}",
            base_url
                .trim_end_matches('/')
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
            token
        );

        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (sink, mut stream) = ws_stream.split();

        let user_id = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayFrame>(&text)? {
                    GatewayFrame::Ready { user_id } => break user_id,
                    other => debug!("Ignoring frame before ready: {:?}", other),
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::NotReady),
            }
        };

        info!("Gateway ready for {}", user_id);
        Ok(Self { user_id, sink, stream })
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub async fn subscribe(&mut self, conversation_ids: Vec<Uuid>) -> ClientResult<()> {
        self.send(&GatewayCommand::Subscribe { conversation_ids }).await
    }

    pub async fn unsubscribe(&mut self, conversation_ids: Vec<Uuid>) -> ClientResult<()> {
        self.send(&GatewayCommand::Unsubscribe { conversation_ids }).await
    }

    pub async fn send_typing(&mut self, conversation_id: Uuid, is_typing: bool) -> ClientResult<()> {
        self.send(&GatewayCommand::Typing {
            conversation_id,
            is_typing,
        })
        .await
    }

    /// Next frame from the server, or `None` once the connection is closed.
    /// Pings are answered by the websocket layer while reading.
    pub async fn next_event(&mut self) -> ClientResult<Option<GatewayFrame>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => warn!("Unparseable gateway frame: {}", e),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Send a close frame and shut the connection down.
    pub async fn close(mut self) -> ClientResult<()> {
        self.sink.close().await?;
        Ok(())
    }

    async fn send(&mut self, command: &GatewayCommand) -> ClientResult<()> {
        let text = serde_json::to_string(command)?;
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }
}
