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

//! Shared helpers for integration-testing the measurement-plane client: an
//! in-memory loopback broker, a scripted remote measurement agent, stub
//! validators, and a polling helper for asynchronous assertions.

use async_trait::async_trait;
use mplane_client::transport::{
    InboundMessage, OutboundMessage, SubscriptionHandle, TopicListener, Transport,
    TransportError,
};
use mplane_client::validate::{SchemaValidator, ValidationError};
use mplane_client::wire::codec::{self, PayloadEncoding};
use mplane_client::wire::topics::{results_topic, DISCOVERY_TOPIC, SUBMISSION_TOPIC};
use mplane_client::{LifecycleState, Measurement};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Installs a test tracing subscriber; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Polls `probe` until it returns true or `bound` elapses.
pub async fn eventually<F>(bound: Duration, mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        if probe() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls a measurement until it reaches `expected` or `bound` elapses.
pub async fn wait_for_state(
    measurement: &Measurement,
    expected: &LifecycleState,
    bound: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        if measurement.state().await == *expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

type ListenerEntry = (SubscriptionHandle, Arc<dyn TopicListener>);

/// In-memory publish/subscribe broker with no replay: a message published
/// while nobody subscribes to its topic is gone, which is exactly the
/// lost-reply hazard the rendezvous ordering exists to avoid.
#[derive(Default)]
pub struct LoopbackBroker {
    next_token: AtomicU64,
    listeners: Mutex<HashMap<String, Vec<ListenerEntry>>>,
    published: Mutex<Vec<(String, OutboundMessage)>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.listeners
            .lock()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Every publish seen so far on `topic`.
    pub async fn published_on(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Publishes raw bytes with no encoding tag, as an older peer would.
    pub async fn publish_untagged(&self, topic: &str, payload: Vec<u8>) {
        self.dispatch(topic, payload, None, None).await;
    }

    async fn dispatch(
        &self,
        topic: &str,
        payload: Vec<u8>,
        encoding: Option<PayloadEncoding>,
        reply_to: Option<String>,
    ) {
        let listeners: Vec<Arc<dyn TopicListener>> = {
            self.listeners
                .lock()
                .await
                .get(topic)
                .map(|entries| entries.iter().map(|(_, listener)| listener.clone()).collect())
                .unwrap_or_default()
        };
        debug!(topic, listeners = listeners.len(), "loopback dispatch");
        let inbound = InboundMessage {
            topic: topic.to_string(),
            payload,
            encoding,
            reply_to,
        };
        for listener in listeners {
            listener.on_message(inbound.clone()).await;
        }
    }
}

#[async_trait]
impl Transport for LoopbackBroker {
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), message.clone()));
        self.dispatch(
            topic,
            message.payload,
            Some(message.encoding),
            message.reply_to,
        )
        .await;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn TopicListener>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let handle =
            SubscriptionHandle::new(topic, self.next_token.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((handle.clone(), listener));
        Ok(handle)
    }

    async fn close(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        let mut listeners = self.listeners.lock().await;
        if let Some(entries) = listeners.get_mut(handle.topic()) {
            entries.retain(|(existing, _)| existing != handle);
            if entries.is_empty() {
                listeners.remove(handle.topic());
            }
        }
        Ok(())
    }
}

/// Collects every delivered message; handy for probing raw topics.
#[derive(Default)]
pub struct CollectingListener {
    messages: Mutex<Vec<InboundMessage>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl TopicListener for CollectingListener {
    async fn on_message(&self, message: InboundMessage) {
        self.messages.lock().await.push(message);
    }
}

/// How the scripted agent acknowledges submissions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckMode {
    /// Echo a receipt, flagged as an interrupt receipt when the submitted
    /// specification carries interrupt mode.
    Acknowledge,
    /// Always acknowledge with an interrupt-flagged receipt.
    AcknowledgeInterrupt,
    /// Never reply.
    Silent,
    /// Reply with a body that is no receipt at all.
    Malformed,
}

enum AgentRole {
    Discovery,
    Submission,
}

struct AgentListener {
    agent: Arc<ScriptedAgent>,
    role: AgentRole,
}

#[async_trait]
impl TopicListener for AgentListener {
    async fn on_message(&self, message: InboundMessage) {
        match self.role {
            AgentRole::Discovery => self.agent.answer_discovery(message).await,
            AgentRole::Submission => self.agent.answer_submission(message).await,
        }
    }
}

/// Scripted remote measurement agent: advertises a capability directory,
/// acknowledges specifications per [`AckMode`], records everything it
/// receives, and can stream result batches.
pub struct ScriptedAgent {
    broker: Arc<LoopbackBroker>,
    directory: Option<Value>,
    ack_mode: AckMode,
    received: Mutex<Vec<Value>>,
}

impl ScriptedAgent {
    pub async fn start(
        broker: Arc<LoopbackBroker>,
        directory: Option<Value>,
        ack_mode: AckMode,
    ) -> Arc<Self> {
        let agent = Arc::new(Self {
            broker: broker.clone(),
            directory,
            ack_mode,
            received: Mutex::new(Vec::new()),
        });
        broker
            .subscribe(
                DISCOVERY_TOPIC,
                Arc::new(AgentListener {
                    agent: agent.clone(),
                    role: AgentRole::Discovery,
                }),
            )
            .await
            .expect("subscribe discovery topic");
        broker
            .subscribe(
                SUBMISSION_TOPIC,
                Arc::new(AgentListener {
                    agent: agent.clone(),
                    role: AgentRole::Submission,
                }),
            )
            .await
            .expect("subscribe submission topic");
        agent
    }

    /// Every decoded specification body received so far, in order.
    pub async fn received_specifications(&self) -> Vec<Value> {
        self.received.lock().await.clone()
    }

    /// Streams one result batch to a measurement's result topic.
    pub async fn publish_results(&self, measurement_id: &str, values: Value) {
        let body = json!({"result": true, "resultValues": values});
        let payload = serde_json::to_vec(&body).expect("render result batch");
        self.broker
            .publish(
                &results_topic(measurement_id),
                OutboundMessage::tagged(payload, PayloadEncoding::Json),
            )
            .await
            .expect("publish result batch");
    }

    async fn answer_discovery(&self, message: InboundMessage) {
        let (Some(directory), Some(reply_to)) = (&self.directory, message.reply_to) else {
            return;
        };
        let payload = serde_json::to_vec(directory).expect("render directory");
        self.broker
            .publish(
                &reply_to,
                OutboundMessage::tagged(payload, PayloadEncoding::Json),
            )
            .await
            .expect("publish directory reply");
    }

    async fn answer_submission(&self, message: InboundMessage) {
        let specification =
            codec::decode(&message.payload, message.encoding).unwrap_or(Value::Null);
        self.received.lock().await.push(specification.clone());

        let Some(reply_to) = message.reply_to else {
            return;
        };
        let receipt = match self.ack_mode {
            AckMode::Silent => return,
            AckMode::Malformed => json!({"status": "ok"}),
            AckMode::AcknowledgeInterrupt => json!({"receipt": true, "interrupt": true}),
            AckMode::Acknowledge => {
                let is_interrupt = specification.get("mode").and_then(Value::as_str)
                    == Some("interrupt");
                if is_interrupt {
                    json!({"receipt": true, "interrupt": true})
                } else {
                    json!({"receipt": true})
                }
            }
        };
        let payload = serde_json::to_vec(&receipt).expect("render receipt");
        self.broker
            .publish(
                &reply_to,
                OutboundMessage::tagged(payload, PayloadEncoding::Json),
            )
            .await
            .expect("publish receipt");
    }
}

/// Validator that accepts every parameter set.
pub struct AcceptAllValidator;

impl SchemaValidator for AcceptAllValidator {
    fn validate(&self, _instance: &Value, _schema: &Value) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Validator that rejects every parameter set.
pub struct RejectAllValidator;

impl SchemaValidator for RejectAllValidator {
    fn validate(&self, _instance: &Value, _schema: &Value) -> Result<(), ValidationError> {
        Err(ValidationError::new("rejected by test validator"))
    }
}

/// Minimal structural validator: every key named by the schema's `required`
/// array must be present on the instance object.
pub struct RequiredKeysValidator;

impl SchemaValidator for RequiredKeysValidator {
    fn validate(&self, instance: &Value, schema: &Value) -> Result<(), ValidationError> {
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if instance.get(key).is_none() {
                return Err(ValidationError::new(format!("missing required key: {key}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CollectingListener, LoopbackBroker};
    use mplane_client::transport::{OutboundMessage, Transport};
    use mplane_client::wire::codec::PayloadEncoding;
    use std::sync::Arc;

    #[tokio::test]
    async fn a_reply_published_before_the_subscriber_exists_is_lost() {
        let broker = LoopbackBroker::new();
        let listener = Arc::new(CollectingListener::new());

        broker
            .publish(
                "topic://orphan",
                OutboundMessage::tagged(b"{}".to_vec(), PayloadEncoding::Json),
            )
            .await
            .expect("publish");
        broker
            .subscribe("topic://orphan", listener.clone())
            .await
            .expect("subscribe");

        // No replay: the late subscriber sees nothing.
        assert!(listener.messages().await.is_empty());
    }

    #[tokio::test]
    async fn a_live_subscriber_receives_subsequent_publishes() {
        let broker = LoopbackBroker::new();
        let listener = Arc::new(CollectingListener::new());

        broker
            .subscribe("topic://live", listener.clone())
            .await
            .expect("subscribe");
        broker
            .publish(
                "topic://live",
                OutboundMessage::tagged(b"{}".to_vec(), PayloadEncoding::Json),
            )
            .await
            .expect("publish");

        assert_eq!(listener.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = LoopbackBroker::new();
        let listener = Arc::new(CollectingListener::new());

        let handle = broker
            .subscribe("topic://once", listener)
            .await
            .expect("subscribe");
        broker.close(&handle).await.expect("first close");
        broker.close(&handle).await.expect("second close");
        assert_eq!(broker.subscriber_count("topic://once").await, 0);
    }
}
