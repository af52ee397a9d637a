// src/engine/remote.rs

use std::sync::Arc;

use crate::transport::{ChannelError, ReplyBody, Request, RpcClient};
use crate::types::BoxFuture;

use super::{CallError, CallResult, ExecutionEngine, PendingCommand, ScopeHandle};

/// [`ExecutionEngine`] proxy that forwards every call over an [`RpcClient`].
#[derive(Debug, Clone)]
pub struct RemoteEngine {
    client: Arc<RpcClient>,
}

impl RemoteEngine {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    async fn call(&self, request: Request) -> CallResult<ReplyBody> {
        match self.client.call(request).await? {
            ReplyBody::Error(err) => Err(CallError::Remote(err)),
            body => Ok(body),
        }
    }
}

impl ExecutionEngine for RemoteEngine {
    fn execute(&self, command: PendingCommand) -> BoxFuture<'_, CallResult<Option<String>>> {
        Box::pin(async move {
            let request = Request::Execute {
                command: command.id,
                source: command.command.source().to_string(),
                scope: command.scope,
            };
            match self.call(request).await? {
                ReplyBody::Value(value) => Ok(value),
                _ => Err(ChannelError::UnexpectedReply("execute").into()),
            }
        })
    }

    fn member_names(&self, expression: &str) -> BoxFuture<'_, CallResult<Vec<String>>> {
        let expression = expression.to_string();
        Box::pin(async move {
            match self.call(Request::MemberNames { expression }).await? {
                ReplyBody::Names(names) => Ok(names),
                _ => Err(ChannelError::UnexpectedReply("member_names").into()),
            }
        })
    }

    fn create_scope(&self) -> BoxFuture<'_, CallResult<ScopeHandle>> {
        Box::pin(async move {
            match self.call(Request::CreateScope).await? {
                ReplyBody::Scope(scope) => Ok(scope),
                _ => Err(ChannelError::UnexpectedReply("create_scope").into()),
            }
        })
    }
}
