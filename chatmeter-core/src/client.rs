use async_trait::async_trait;
use futures::Stream;

use crate::error::ReportableError;
use crate::model::{ChatCompletion, ChatCompletionChunk, RequestPayload};

/// What a chat-completion call hands back: a whole response, or a lazy
/// sequence of chunks the caller pulls at its own pace.
#[derive(Debug)]
pub enum Completion<S> {
    Direct(ChatCompletion),
    Stream(S),
}

impl<S> Completion<S> {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    pub fn into_direct(self) -> Option<ChatCompletion> {
        match self {
            Self::Direct(resp) => Some(resp),
            Self::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<S> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Direct(_) => None,
        }
    }
}

/// Closed set of call outcomes, so the interceptor's branch is exhaustive.
#[derive(Debug)]
pub enum Outcome<S, E> {
    Direct(ChatCompletion),
    Streaming(S),
    Failed(E),
}

impl<S, E> From<Result<Completion<S>, E>> for Outcome<S, E> {
    fn from(result: Result<Completion<S>, E>) -> Self {
        match result {
            Ok(Completion::Direct(resp)) => Self::Direct(resp),
            Ok(Completion::Stream(s)) => Self::Streaming(s),
            Err(e) => Self::Failed(e),
        }
    }
}

/// Blocking chat-completion client.
pub trait ChatClient {
    type Error: ReportableError;
    type Stream: Iterator<Item = Result<ChatCompletionChunk, Self::Error>>;

    fn create(&self, payload: &RequestPayload) -> Result<Completion<Self::Stream>, Self::Error>;
}

/// Asynchronous chat-completion client.
#[async_trait]
pub trait AsyncChatClient: Send + Sync {
    type Error: ReportableError + Send + 'static;
    type Stream: Stream<Item = Result<ChatCompletionChunk, Self::Error>> + Send + Unpin + 'static;

    async fn create_async(
        &self,
        payload: &RequestPayload,
    ) -> Result<Completion<Self::Stream>, Self::Error>;
}
