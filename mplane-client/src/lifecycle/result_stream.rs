//! Result-stream worker: one producer subscription, one consumer task.
//!
//! The transport listener is the producer; a single spawned consumer owns
//! decode, accumulation and callback delivery, so the caller's handler never
//! runs on a transport thread and cancellation is a cooperative signal
//! checked between deliveries instead of a killed callback.

use crate::lifecycle::measurement::{enter_terminal, CompletionCallback, ResultCallback};
use crate::lifecycle::state::LifecycleState;
use crate::observability::events;
use crate::transport::{
    InboundMessage, SubscriptionHandle, TopicListener, Transport, TransportError,
};
use crate::wire::codec;
use crate::wire::envelope::{classify, InboundEnvelope};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const COMPONENT: &str = "result_stream";

/// Everything the consumer worker needs; deliberately not the whole
/// measurement, so the worker keeps nothing alive beyond the shared state it
/// writes to.
pub(crate) struct StreamContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: Arc<Mutex<LifecycleState>>,
    pub(crate) results: Arc<Mutex<Vec<Value>>>,
    pub(crate) result_callback: ResultCallback,
    pub(crate) completion_callback: Option<CompletionCallback>,
}

struct ResultListener {
    worker_id: String,
    sender: mpsc::Sender<InboundMessage>,
}

#[async_trait]
impl TopicListener for ResultListener {
    async fn on_message(&self, message: InboundMessage) {
        if let Err(error) = self.sender.try_send(message) {
            warn!(
                event = events::RESULT_QUEUE_FULL,
                component = COMPONENT,
                worker = %self.worker_id,
                err = %error,
                "dropping result message, consumer queue unavailable"
            );
        }
    }
}

#[derive(Eq, PartialEq)]
enum Delivery {
    Continue,
    EndOfStream,
}

/// One open result subscription plus its consumer worker.
pub(crate) struct ResultStream {
    handle: SubscriptionHandle,
    close_signal: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl ResultStream {
    /// Subscribes to the measurement's result topic and spawns the consumer.
    pub(crate) async fn open(
        topic: &str,
        queue_size: usize,
        context: StreamContext,
    ) -> Result<Self, TransportError> {
        let worker_id = Uuid::new_v4().hyphenated().to_string();
        let (sender, receiver) = mpsc::channel(queue_size);
        let listener = Arc::new(ResultListener {
            worker_id: worker_id.clone(),
            sender,
        });
        let handle = context.transport.subscribe(topic, listener).await?;
        let (close_signal, close_watch) = watch::channel(false);
        let worker = tokio::spawn(Self::consume_loop(
            worker_id,
            handle.clone(),
            receiver,
            close_watch,
            context,
        ));
        Ok(Self {
            handle,
            close_signal,
            worker,
        })
    }

    /// Cooperative shutdown: raise the close signal, wait for the worker to
    /// observe it between deliveries, then close the subscription. Once this
    /// returns no further result callback can fire.
    pub(crate) async fn close(self, transport: &Arc<dyn Transport>) {
        let ResultStream {
            handle,
            close_signal,
            worker,
        } = self;
        let _ = close_signal.send(true);
        if let Err(error) = worker.await {
            warn!(
                event = events::RESULT_WORKER_DOWN,
                component = COMPONENT,
                err = %error,
                "result worker ended abnormally"
            );
        }
        if let Err(error) = transport.close(&handle).await {
            warn!(
                event = events::STREAM_CLOSE_FAILED,
                component = COMPONENT,
                topic = handle.topic(),
                err = %error,
                "unable to close result subscription"
            );
        }
    }

    async fn consume_loop(
        worker_id: String,
        handle: SubscriptionHandle,
        mut receiver: mpsc::Receiver<InboundMessage>,
        mut close_watch: watch::Receiver<bool>,
        context: StreamContext,
    ) {
        debug!(
            event = events::RESULT_WORKER_UP,
            component = COMPONENT,
            worker = %worker_id,
            topic = handle.topic(),
            "result worker up"
        );

        let mut stream_ended = false;
        loop {
            tokio::select! {
                biased;
                _ = close_watch.changed() => break,
                maybe_message = receiver.recv() => {
                    let Some(message) = maybe_message else { break };
                    if Self::deliver(&worker_id, &message, &context).await
                        == Delivery::EndOfStream
                    {
                        stream_ended = true;
                        break;
                    }
                }
            }
        }

        // Idempotent against ResultStream::close running the same cleanup.
        if let Err(error) = context.transport.close(&handle).await {
            warn!(
                event = events::STREAM_CLOSE_FAILED,
                component = COMPONENT,
                worker = %worker_id,
                err = %error,
                "unable to close result subscription"
            );
        }
        if stream_ended {
            enter_terminal(
                &context.state,
                context.completion_callback.as_ref(),
                LifecycleState::Completed,
            )
            .await;
        }

        debug!(
            event = events::RESULT_WORKER_DOWN,
            component = COMPONENT,
            worker = %worker_id,
            "result worker down"
        );
    }

    async fn deliver(
        worker_id: &str,
        message: &InboundMessage,
        context: &StreamContext,
    ) -> Delivery {
        let value = match codec::decode(&message.payload, message.encoding) {
            Ok(value) => value,
            Err(failure) => {
                warn!(
                    event = events::RESULT_DECODE_FAILED,
                    component = COMPONENT,
                    worker = %worker_id,
                    err = %failure,
                    "dropping undecodable result payload"
                );
                return Delivery::Continue;
            }
        };

        let InboundEnvelope::Result(batch) = classify(&value) else {
            warn!(
                event = events::RESULT_DROPPED,
                component = COMPONENT,
                worker = %worker_id,
                reason = "not_a_result",
                "dropping non-result payload on result topic"
            );
            return Delivery::Continue;
        };

        if batch.is_end_of_stream() {
            debug!(
                event = events::RESULT_EOF,
                component = COMPONENT,
                worker = %worker_id,
                "end-of-stream sentinel received"
            );
            // The sentinel batch is delivered but never accumulated.
            (context.result_callback)(&batch.values);
            return Delivery::EndOfStream;
        }

        context
            .results
            .lock()
            .await
            .push(Value::Array(batch.values.clone()));
        (context.result_callback)(&batch.values);
        Delivery::Continue
    }
}
