// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::backtrace::Backtrace;
use std::sync::Arc;

use crate::model::{DispatcherId, NodeId, TableId};

pub type MetaResult<T> = std::result::Result<T, MetaError>;

#[derive(thiserror::Error, Debug)]
enum MetaErrorInner {
    #[error("connection to node {0} not found")]
    ConnectionNotFound(NodeId),

    #[error("connection to node {0} failed: {1}")]
    ConnectionFailed(NodeId, String),

    #[error("message to node {0} congested")]
    MessageCongested(NodeId),

    #[error("receive from node {0} failed: {1}")]
    MessageReceiveFailed(NodeId, String),

    #[error("invalid message on topic {0}: {1}")]
    InvalidMessage(String, String),

    #[error("table {0} is deleted before ts {1}")]
    SchemaDeleted(TableId, u64),

    #[error("operator rejected: {0}")]
    OperatorRejected(String),

    #[error("span {0} not found")]
    SpanNotFound(DispatcherId),

    #[error("invalid node: {0}")]
    InvalidNode(NodeId),

    #[error(transparent)]
    Internal(anyhow::Error),
}

/// Error of the control plane. Cheap to clone, so it can be attached to the
/// next heartbeat as a running error while the original caller also keeps it.
#[derive(thiserror::Error, Clone)]
#[error("{inner}")]
pub struct MetaError {
    inner: Arc<MetaErrorInner>,
    backtrace: Arc<Backtrace>,
}

impl std::fmt::Debug for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)?;
        writeln!(f)?;
        write!(f, "  backtrace:\n{}", self.backtrace)?;
        Ok(())
    }
}

impl From<MetaErrorInner> for MetaError {
    fn from(inner: MetaErrorInner) -> Self {
        Self {
            inner: Arc::new(inner),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
}

impl MetaError {
    pub fn connection_not_found(node: NodeId) -> Self {
        MetaErrorInner::ConnectionNotFound(node).into()
    }

    pub fn connection_failed(node: NodeId, reason: impl ToString) -> Self {
        MetaErrorInner::ConnectionFailed(node, reason.to_string()).into()
    }

    pub fn message_congested(node: NodeId) -> Self {
        MetaErrorInner::MessageCongested(node).into()
    }

    pub fn message_receive_failed(node: NodeId, reason: impl ToString) -> Self {
        MetaErrorInner::MessageReceiveFailed(node, reason.to_string()).into()
    }

    pub fn invalid_message(topic: impl ToString, reason: impl ToString) -> Self {
        MetaErrorInner::InvalidMessage(topic.to_string(), reason.to_string()).into()
    }

    pub fn schema_deleted(table_id: TableId, ts: u64) -> Self {
        MetaErrorInner::SchemaDeleted(table_id, ts).into()
    }

    pub fn operator_rejected(reason: impl ToString) -> Self {
        MetaErrorInner::OperatorRejected(reason.to_string()).into()
    }

    pub fn span_not_found(id: DispatcherId) -> Self {
        MetaErrorInner::SpanNotFound(id).into()
    }

    pub fn invalid_node(node: NodeId) -> Self {
        MetaErrorInner::InvalidNode(node).into()
    }

    /// The only error fatal to a changefeed: a DDL barrier referenced table
    /// metadata that no longer exists at the barrier timestamp.
    pub fn is_schema_deleted(&self) -> bool {
        matches!(&*self.inner, MetaErrorInner::SchemaDeleted(_, _))
    }

    pub fn is_congested(&self) -> bool {
        matches!(&*self.inner, MetaErrorInner::MessageCongested(_))
    }

    pub fn error_code(&self) -> &'static str {
        match &*self.inner {
            MetaErrorInner::ConnectionNotFound(_) => "ConnectionNotFound",
            MetaErrorInner::ConnectionFailed(_, _) => "ConnectionFailed",
            MetaErrorInner::MessageCongested(_) => "MessageCongested",
            MetaErrorInner::MessageReceiveFailed(_, _) => "MessageReceiveFailed",
            MetaErrorInner::InvalidMessage(_, _) => "InvalidMessage",
            MetaErrorInner::SchemaDeleted(_, _) => "SchemaDeleted",
            MetaErrorInner::OperatorRejected(_) => "OperatorRejected",
            MetaErrorInner::SpanNotFound(_) => "SpanNotFound",
            MetaErrorInner::InvalidNode(_) => "InvalidNode",
            MetaErrorInner::Internal(_) => "Internal",
        }
    }
}

impl From<anyhow::Error> for MetaError {
    fn from(a: anyhow::Error) -> Self {
        MetaErrorInner::Internal(a).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = MetaError::schema_deleted(1, 10);
        assert!(err.is_schema_deleted());
        assert!(!err.is_congested());
        assert_eq!(err.error_code(), "SchemaDeleted");

        let err = MetaError::message_congested(NodeId::from("node1"));
        assert!(err.is_congested());

        let cloned = err.clone();
        assert_eq!(cloned.error_code(), "MessageCongested");
    }
}
