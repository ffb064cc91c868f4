//! One bounded-wait request/ephemeral-reply exchange over the transport.

use crate::observability::events;
use crate::transport::{
    InboundMessage, OutboundMessage, SubscriptionHandle, TopicListener, Transport,
    TransportError,
};
use crate::wire::topics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const COMPONENT: &str = "rendezvous";

/// Room for stray duplicate replies; only the first is ever consumed.
const REPLY_QUEUE_SIZE: usize = 4;

struct ReplyListener {
    reply_topic: String,
    sender: mpsc::Sender<InboundMessage>,
}

#[async_trait]
impl TopicListener for ReplyListener {
    async fn on_message(&self, message: InboundMessage) {
        if let Err(error) = self.sender.try_send(message) {
            debug!(
                event = events::RENDEZVOUS_EXTRA_REPLY_DROPPED,
                component = COMPONENT,
                reply_topic = %self.reply_topic,
                err = %error,
                "dropping reply beyond the first"
            );
        }
    }
}

/// Performs request/ephemeral-reply exchanges over one transport session.
#[derive(Clone)]
pub(crate) struct RendezvousChannel {
    transport: Arc<dyn Transport>,
}

/// A rendezvous whose request is published and whose reply subscription is
/// live. Waiting consumes the exchange and closes the subscription on every
/// path.
pub(crate) struct PendingRendezvous {
    transport: Arc<dyn Transport>,
    handle: SubscriptionHandle,
    replies: mpsc::Receiver<InboundMessage>,
    reply_topic: String,
}

impl RendezvousChannel {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Opens the exchange in the order the protocol requires: subscribe to a
    /// fresh reply topic first, publish the request only once the
    /// subscription is live. A reply published before the subscriber exists
    /// is lost for good; the transport keeps no history.
    pub(crate) async fn open(
        &self,
        request_topic: &str,
        request: OutboundMessage,
    ) -> Result<PendingRendezvous, TransportError> {
        let reply_topic = topics::fresh_reply_topic();
        let (sender, replies) = mpsc::channel(REPLY_QUEUE_SIZE);
        let listener = Arc::new(ReplyListener {
            reply_topic: reply_topic.clone(),
            sender,
        });

        let handle = self.transport.subscribe(&reply_topic, listener).await?;
        debug!(
            event = events::RENDEZVOUS_OPEN,
            component = COMPONENT,
            request_topic,
            reply_topic = %reply_topic,
            "reply subscription live, publishing request"
        );

        let request = request.with_reply_to(&reply_topic);
        if let Err(error) = self.transport.publish(request_topic, request).await {
            close_reply_subscription(&self.transport, &handle, &reply_topic).await;
            return Err(error);
        }

        Ok(PendingRendezvous {
            transport: self.transport.clone(),
            handle,
            replies,
            reply_topic,
        })
    }

    /// Full exchange: open, wait out the bound, close.
    pub(crate) async fn call(
        &self,
        request_topic: &str,
        request: OutboundMessage,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>, TransportError> {
        self.open(request_topic, request).await?.wait(timeout).await
    }
}

impl PendingRendezvous {
    pub(crate) fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Resolves with the first reply, or `None` once `timeout` elapses. An
    /// absent reply is an outcome, not an error; callers decide whether to
    /// retry. The reply subscription is closed on both paths.
    pub(crate) async fn wait(
        mut self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>, TransportError> {
        let reply = match tokio::time::timeout(timeout, self.replies.recv()).await {
            Ok(reply) => reply,
            Err(_elapsed) => {
                debug!(
                    event = events::RENDEZVOUS_TIMEOUT,
                    component = COMPONENT,
                    reply_topic = %self.reply_topic,
                    "no reply within bound"
                );
                None
            }
        };
        close_reply_subscription(&self.transport, &self.handle, &self.reply_topic).await;
        Ok(reply)
    }
}

async fn close_reply_subscription(
    transport: &Arc<dyn Transport>,
    handle: &SubscriptionHandle,
    reply_topic: &str,
) {
    if let Err(error) = transport.close(handle).await {
        warn!(
            event = events::RENDEZVOUS_CLOSE_FAILED,
            component = COMPONENT,
            reply_topic = %reply_topic,
            err = %error,
            "unable to close reply subscription"
        );
    }
}
