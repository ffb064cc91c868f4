//! One measurement session: configure, submit, receipt correlation,
//! interrupt.

use crate::client::ClientError;
use crate::correlation::rendezvous::RendezvousChannel;
use crate::lifecycle::result_stream::{ResultStream, StreamContext};
use crate::lifecycle::state::{FailureCause, LifecycleState};
use crate::observability::events;
use crate::transport::{OutboundMessage, Transport};
use crate::validate::SchemaValidator;
use crate::wire::codec::{self, PayloadEncoding};
use crate::wire::envelope::{
    classify, Capability, InboundEnvelope, Receipt, Specification, SpecificationMode,
};
use crate::wire::identifiers::MeasurementId;
use crate::wire::topics::{self, SUBMISSION_TOPIC};
use chrono::Local;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const COMPONENT: &str = "measurement";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Invoked by the result worker for every delivered batch, sentinel batch
/// included.
pub type ResultCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Invoked exactly once when the measurement reaches a terminal state.
pub type CompletionCallback = Arc<dyn Fn(&LifecycleState) + Send + Sync>;

/// Delivery flags recorded on the session and carried for the surrounding
/// pipeline; the protocol engine does not interpret them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeliveryOptions {
    pub stream_results: bool,
    pub redirect_to_storage: bool,
}

struct MeasurementConfig {
    result_callback: ResultCallback,
    completion_callback: Option<CompletionCallback>,
    delivery: DeliveryOptions,
}

struct MeasurementInner {
    capability: Capability,
    transport: Arc<dyn Transport>,
    validator: Arc<dyn SchemaValidator>,
    rendezvous: RendezvousChannel,
    receipt_timeout: Duration,
    result_queue_size: usize,
    state: Arc<Mutex<LifecycleState>>,
    specification: Mutex<Option<Specification>>,
    config: Mutex<Option<MeasurementConfig>>,
    results: Arc<Mutex<Vec<Value>>>,
    stream: Mutex<Option<ResultStream>>,
}

/// One client-side measurement session. Cheap to clone; every clone shares
/// the same lifecycle.
#[derive(Clone)]
pub struct Measurement {
    inner: Arc<MeasurementInner>,
}

impl Measurement {
    pub(crate) fn new(
        capability: Capability,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn SchemaValidator>,
        receipt_timeout: Duration,
        result_queue_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(MeasurementInner {
                rendezvous: RendezvousChannel::new(transport.clone()),
                capability,
                transport,
                validator,
                receipt_timeout,
                result_queue_size,
                state: Arc::new(Mutex::new(LifecycleState::Created)),
                specification: Mutex::new(None),
                config: Mutex::new(None),
                results: Arc::new(Mutex::new(Vec::new())),
                stream: Mutex::new(None),
            }),
        }
    }

    pub fn capability(&self) -> &Capability {
        &self.inner.capability
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.state.lock().await.clone()
    }

    /// Accumulated result batches delivered so far, one entry per batch.
    pub async fn results(&self) -> Vec<Value> {
        self.inner.results.lock().await.clone()
    }

    /// Delivery flags accepted at configuration time.
    pub async fn delivery_options(&self) -> Option<DeliveryOptions> {
        self.inner
            .config
            .lock()
            .await
            .as_ref()
            .map(|config| config.delivery)
    }

    /// The correlation key naming this measurement's result topic, available
    /// once configured.
    pub async fn measurement_id(&self) -> Option<MeasurementId> {
        self.inner
            .specification
            .lock()
            .await
            .as_ref()
            .map(Specification::measurement_id)
    }

    /// Validates `parameters` against the capability's declared schema and,
    /// on success, stamps the specification and moves to `Configured`. A
    /// rejected configuration returns `false`, leaves the state untouched
    /// and causes no network traffic.
    pub async fn configure(
        &self,
        schedule: &str,
        parameters: Value,
        result_callback: ResultCallback,
        options: DeliveryOptions,
        completion_callback: Option<CompletionCallback>,
    ) -> bool {
        {
            let state = self.inner.state.lock().await;
            if !matches!(
                *state,
                LifecycleState::Created | LifecycleState::Configured
            ) {
                warn!(
                    component = COMPONENT,
                    state = %*state,
                    "configure refused after submission"
                );
                return false;
            }
        }

        if let Err(validation_error) = self
            .inner
            .validator
            .validate(&parameters, &self.inner.capability.parameters_schema)
        {
            error!(
                component = COMPONENT,
                err = %validation_error,
                "parameter validation failed"
            );
            return false;
        }

        let specification = Specification {
            endpoint: self.inner.capability.endpoint.clone(),
            capability_name: self.inner.capability.capability_name.clone(),
            capability_kind: self.inner.capability.capability_kind.clone(),
            label: self.inner.capability.label.clone(),
            parameters,
            schedule: schedule.to_string(),
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            mode: SpecificationMode::Specification,
        };

        *self.inner.specification.lock().await = Some(specification);
        *self.inner.config.lock().await = Some(MeasurementConfig {
            result_callback,
            completion_callback,
            delivery: options,
        });
        *self.inner.state.lock().await = LifecycleState::Configured;
        debug!(
            component = COMPONENT,
            stream_results = options.stream_results,
            redirect_to_storage = options.redirect_to_storage,
            "measurement configured"
        );
        true
    }

    /// Publishes the specification to the submission topic and correlates
    /// the receipt. The outcome lands in the measurement state: a missing
    /// receipt is `Failed(NoAcknowledgment)`, never a silent `Submitted`.
    pub(crate) async fn submit(&self) -> Result<(), ClientError> {
        let specification = { self.inner.specification.lock().await.clone() };
        let Some(specification) = specification else {
            return Err(ClientError::NotConfigured);
        };
        {
            let state = self.inner.state.lock().await;
            if *state != LifecycleState::Configured {
                return Err(ClientError::InvalidState(state.clone()));
            }
        }

        let payload = encode_specification(&specification)?;
        let request = OutboundMessage::tagged(payload, PayloadEncoding::Json);

        let pending = match self.inner.rendezvous.open(SUBMISSION_TOPIC, request).await {
            Ok(pending) => pending,
            Err(transport_error) => {
                self.fail(FailureCause::Transport(transport_error.to_string()))
                    .await;
                return Err(ClientError::Transport(transport_error));
            }
        };
        *self.inner.state.lock().await = LifecycleState::Submitted;
        debug!(
            component = COMPONENT,
            reply_topic = pending.reply_topic(),
            "specification published"
        );

        *self.inner.state.lock().await = LifecycleState::AwaitingReceipt;
        let reply = match pending.wait(self.inner.receipt_timeout).await {
            Ok(reply) => reply,
            Err(transport_error) => {
                self.fail(FailureCause::Transport(transport_error.to_string()))
                    .await;
                return Err(ClientError::Transport(transport_error));
            }
        };

        let Some(reply) = reply else {
            warn!(
                event = events::RECEIPT_TIMEOUT,
                component = COMPONENT,
                "no acknowledgment within bound"
            );
            self.fail(FailureCause::NoAcknowledgment).await;
            return Ok(());
        };

        let Some(receipt) = usable_receipt(&reply.payload, reply.encoding) else {
            warn!(
                event = events::RECEIPT_UNUSABLE,
                component = COMPONENT,
                "reply on receipt topic carried no usable receipt"
            );
            self.fail(FailureCause::UnusableReceipt).await;
            return Ok(());
        };

        if receipt.interrupt {
            debug!(component = COMPONENT, "receipt acknowledges an interrupt");
            self.enter_terminal_state(LifecycleState::Interrupted).await;
            return Ok(());
        }

        self.open_result_stream(&specification).await
    }

    /// The receipt gates the subscription: the result topic is only joined
    /// once the remote agent has accepted the specification, trading a
    /// little latency for never holding subscriptions to topics that stay
    /// silent after a rejected request. (An eager variant would subscribe
    /// before the receipt arrives; the identifier is computable either way.)
    async fn open_result_stream(
        &self,
        specification: &Specification,
    ) -> Result<(), ClientError> {
        let measurement_id = specification.measurement_id();
        let topic = topics::results_topic(&measurement_id);

        let (result_callback, completion_callback) = {
            let config = self.inner.config.lock().await;
            let Some(config) = config.as_ref() else {
                return Err(ClientError::NotConfigured);
            };
            (
                config.result_callback.clone(),
                config.completion_callback.clone(),
            )
        };

        let context = StreamContext {
            transport: self.inner.transport.clone(),
            state: self.inner.state.clone(),
            results: self.inner.results.clone(),
            result_callback,
            completion_callback,
        };

        // Streaming is entered before the subscribe so an immediate
        // end-of-stream from the worker cannot be overwritten afterwards.
        *self.inner.state.lock().await = LifecycleState::Streaming;
        match ResultStream::open(&topic, self.inner.result_queue_size, context).await {
            Ok(stream) => {
                *self.inner.stream.lock().await = Some(stream);
                debug!(
                    component = COMPONENT,
                    measurement_id = %measurement_id,
                    "result stream open"
                );
                Ok(())
            }
            Err(transport_error) => {
                self.fail(FailureCause::Transport(transport_error.to_string()))
                    .await;
                Err(ClientError::Transport(transport_error))
            }
        }
    }

    /// Best-effort cancellation of an in-flight measurement. The interrupt
    /// specification is built from the same immutable record as the original
    /// submission, so it names the same measurement identifier. The local
    /// transition reflects client intent; the remote agent stays the
    /// authority on whether execution actually stops.
    pub(crate) async fn interrupt(&self) -> Result<(), ClientError> {
        let specification = { self.inner.specification.lock().await.clone() };
        let Some(specification) = specification else {
            return Err(ClientError::NotConfigured);
        };
        {
            let state = self.inner.state.lock().await;
            if state.is_terminal() {
                debug!(
                    component = COMPONENT,
                    state = %*state,
                    "interrupt on a terminal measurement is a no-op"
                );
                return Ok(());
            }
            if matches!(*state, LifecycleState::Created | LifecycleState::Configured) {
                warn!(
                    component = COMPONENT,
                    state = %*state,
                    "nothing in flight to interrupt"
                );
                return Ok(());
            }
        }

        // Delivery stops first: once this call returns, no further result
        // callback may fire, whatever is still in flight.
        let stream = { self.inner.stream.lock().await.take() };
        if let Some(stream) = stream {
            stream.close(&self.inner.transport).await;
        }
        self.enter_terminal_state(LifecycleState::Interrupted).await;

        let interrupt_specification = specification.to_interrupt();
        let payload = encode_specification(&interrupt_specification)?;
        let request = OutboundMessage::tagged(payload, PayloadEncoding::Json);
        let outcome = self
            .inner
            .rendezvous
            .call(SUBMISSION_TOPIC, request, self.inner.receipt_timeout)
            .await
            .map_err(ClientError::Transport)?;

        match outcome {
            Some(_reply) => debug!(
                component = COMPONENT,
                measurement_id = %interrupt_specification.measurement_id(),
                "interrupt acknowledged"
            ),
            None => warn!(
                event = events::RECEIPT_TIMEOUT,
                component = COMPONENT,
                measurement_id = %interrupt_specification.measurement_id(),
                "interrupt not acknowledged within bound"
            ),
        }
        Ok(())
    }

    async fn fail(&self, cause: FailureCause) {
        self.enter_terminal_state(LifecycleState::Failed(cause)).await;
    }

    async fn enter_terminal_state(&self, next: LifecycleState) {
        let completion_callback = {
            self.inner
                .config
                .lock()
                .await
                .as_ref()
                .and_then(|config| config.completion_callback.clone())
        };
        enter_terminal(&self.inner.state, completion_callback.as_ref(), next).await;
    }
}

/// Moves to a terminal state exactly once; later attempts are ignored so a
/// racing interrupt and end-of-stream cannot double-fire the completion
/// callback.
pub(crate) async fn enter_terminal(
    state: &Mutex<LifecycleState>,
    completion_callback: Option<&CompletionCallback>,
    next: LifecycleState,
) {
    {
        let mut current = state.lock().await;
        if current.is_terminal() {
            debug!(
                component = COMPONENT,
                current = %*current,
                refused = %next,
                "terminal state already reached"
            );
            return;
        }
        *current = next.clone();
    }
    debug!(
        event = events::LIFECYCLE_TERMINAL,
        component = COMPONENT,
        state = %next,
        "measurement reached terminal state"
    );
    if let Some(callback) = completion_callback {
        callback(&next);
    }
}

fn encode_specification(specification: &Specification) -> Result<Vec<u8>, ClientError> {
    let body = serde_json::to_value(specification)
        .map_err(|error| ClientError::Encode(error.to_string()))?;
    codec::encode(&body, PayloadEncoding::Json)
        .map_err(|error| ClientError::Encode(error.to_string()))
}

fn usable_receipt(payload: &[u8], encoding: Option<PayloadEncoding>) -> Option<Receipt> {
    let value = match codec::decode(payload, encoding) {
        Ok(value) => value,
        Err(failure) => {
            warn!(
                component = COMPONENT,
                err = %failure,
                "receipt payload not decodable"
            );
            return None;
        }
    };
    match classify(&value) {
        InboundEnvelope::Receipt(receipt) => Some(receipt),
        _ => None,
    }
}
