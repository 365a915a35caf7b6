use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use commons_types::api::{
    ConversationSummary, CreateDirectRequest, EditMessageRequest, HistoryPage, HistoryQuery,
    MarkReadRequest, MarkReadResponse, ReactionOutcome, SendMessageRequest, ToggleReactionRequest,
    ToggleReactionResponse, TypingRequest,
};
use commons_types::models::{Attachment, Conversation, Message};

use crate::connection::GatewayConnection;
use crate::error::{ClientError, ClientResult};

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Thin typed wrapper over the REST surface. Holds no conversation state;
/// results feed the [`Reconciler`](crate::Reconciler).
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Open a gateway connection with the same server and credentials.
    pub async fn open_gateway(&self) -> ClientResult<GatewayConnection> {
        GatewayConnection::open(&self.base_url, &self.token).await
    }

    pub async fn list_conversations(&self) -> ClientResult<Vec<ConversationSummary>> {
        self.json(self.client.get(self.url("/conversations"))).await
    }

    pub async fn create_direct(&self, user_id: Uuid) -> ClientResult<Conversation> {
        let req = self
            .client
            .post(self.url("/conversations/direct"))
            .json(&CreateDirectRequest { user_id });
        self.json(req).await
    }

    /// Send a message. Nothing is inserted locally: the message appears when
    /// the broker echoes it or the next page load includes it.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> ClientResult<Message> {
        let req = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/messages")))
            .json(&SendMessageRequest {
                content: content.to_string(),
                attachments,
            });
        self.json(req).await
    }

    pub async fn fetch_page(&self, conversation_id: Uuid, query: &HistoryQuery) -> ClientResult<HistoryPage> {
        let req = self
            .client
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .query(query);
        self.json(req).await
    }

    pub async fn edit(&self, message_id: Uuid, content: &str) -> ClientResult<Message> {
        let req = self
            .client
            .patch(self.url(&format!("/messages/{message_id}")))
            .json(&EditMessageRequest {
                content: content.to_string(),
            });
        self.json(req).await
    }

    pub async fn delete(&self, message_id: Uuid) -> ClientResult<()> {
        self.empty(self.client.delete(self.url(&format!("/messages/{message_id}"))))
            .await
    }

    pub async fn react(&self, message_id: Uuid, emoji: &str) -> ClientResult<ReactionOutcome> {
        let req = self
            .client
            .post(self.url(&format!("/messages/{message_id}/reactions")))
            .json(&ToggleReactionRequest {
                emoji: emoji.to_string(),
            });
        let res: ToggleReactionResponse = self.json(req).await?;
        Ok(res.result)
    }

    pub async fn mark_read(&self, conversation_id: Uuid, message_ids: Vec<Uuid>) -> ClientResult<MarkReadResponse> {
        let req = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/read")))
            .json(&MarkReadRequest { message_ids });
        self.json(req).await
    }

    pub async fn set_typing(&self, conversation_id: Uuid, is_typing: bool) -> ClientResult<()> {
        let req = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/typing")))
            .json(&TypingRequest { is_typing });
        self.empty(req).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> ClientResult<T> {
        let res = self.execute(req).await?;
        Ok(res.json().await?)
    }

    async fn empty(&self, req: RequestBuilder) -> ClientResult<()> {
        self.execute(req).await?;
        Ok(())
    }

    async fn execute(&self, req: RequestBuilder) -> ClientResult<Response> {
        let res = req.bearer_auth(&self.token).send().await?;
        if res.status().is_success() {
            return Ok(res);
        }

        let status = res.status().as_u16();
        let message = match res.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => "no error body".to_string(),
        };
        Err(ClientError::Api { status, message })
    }
}
