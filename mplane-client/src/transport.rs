/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Publish/subscribe transport seam.
//!
//! The engine never binds to a concrete broker protocol; everything it needs
//! from the messaging layer is expressed here and supplied by the embedder as
//! an `Arc<dyn Transport>` session object scoped to one client.

use crate::wire::codec::PayloadEncoding;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Errors surfaced by a [`Transport`] implementation. Not retried by this
/// crate; callers decide whether an operation is worth repeating.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    /// The broker could not be reached at all.
    BrokerUnreachable(String),
    /// A publish was attempted and rejected.
    PublishFailed(String),
    /// A subscription could not be opened.
    SubscribeFailed(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::BrokerUnreachable(detail) => {
                write!(f, "broker unreachable: {detail}")
            }
            TransportError::PublishFailed(detail) => write!(f, "publish failed: {detail}"),
            TransportError::SubscribeFailed(detail) => write!(f, "subscribe failed: {detail}"),
        }
    }
}

impl Error for TransportError {}

/// One message delivered to a [`TopicListener`].
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Declared encoding of `payload`. Untagged messages from older peers are
    /// trial-decoded.
    pub encoding: Option<PayloadEncoding>,
    /// Return address for request/reply exchanges.
    pub reply_to: Option<String>,
}

/// One message handed to [`Transport::publish`].
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn tagged(payload: Vec<u8>, encoding: PayloadEncoding) -> Self {
        Self {
            payload,
            encoding,
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }
}

/// Receives every message published to one subscribed topic.
#[async_trait]
pub trait TopicListener: Send + Sync {
    async fn on_message(&self, message: InboundMessage);
}

/// Identifies one open subscription for a later [`Transport::close`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionHandle {
    topic: String,
    token: u64,
}

impl SubscriptionHandle {
    pub fn new(topic: &str, token: u64) -> Self {
        Self {
            topic: topic.to_string(),
            token,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Publish/subscribe session contract supplied by the embedder.
///
/// The transport keeps no message history: a publish reaches only the
/// subscriptions live at that moment. `close` must be idempotent; closing a
/// handle twice is a no-op.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, message: OutboundMessage)
        -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn TopicListener>,
    ) -> Result<SubscriptionHandle, TransportError>;

    async fn close(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;
}
