//! Measurement-lifecycle scenarios against the loopback broker: submission,
//! receipt correlation, result streaming, end-of-stream, and interrupt.

use integration_test_utils::{
    eventually, init_tracing, wait_for_state, AckMode, LoopbackBroker, RejectAllValidator,
    RequiredKeysValidator, ScriptedAgent,
};
use mplane_client::wire::codec::{self, PayloadEncoding};
use mplane_client::wire::topics::results_topic;
use mplane_client::{
    Capability, ClientConfig, CompletionCallback, FailureCause, LifecycleState,
    Measurement, MeasurementPlaneClient, OutboundMessage, ResultCallback, Specification,
    Transport, EOF_SENTINEL,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

fn capability() -> Capability {
    Capability {
        id: String::new(),
        endpoint: "amqp://broker:5672".to_string(),
        capability_name: "timetags".to_string(),
        capability_kind: "measure".to_string(),
        label: "Timetag capture".to_string(),
        parameters_schema: json!({"required": ["channels"]}),
    }
}

fn client(broker: &Arc<LoopbackBroker>) -> MeasurementPlaneClient {
    let transport: Arc<dyn Transport> = broker.clone();
    let config = ClientConfig {
        discovery_timeout: Duration::from_millis(200),
        receipt_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    MeasurementPlaneClient::new(
        "lifecycle-test",
        config,
        transport,
        Arc::new(RequiredKeysValidator),
    )
}

struct Callbacks {
    delivered: Arc<StdMutex<Vec<Vec<Value>>>>,
    terminal: Arc<StdMutex<Vec<LifecycleState>>>,
}

impl Callbacks {
    fn new() -> Self {
        Self {
            delivered: Arc::new(StdMutex::new(Vec::new())),
            terminal: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn result_callback(&self) -> ResultCallback {
        let delivered = self.delivered.clone();
        Arc::new(move |values: &[Value]| {
            delivered.lock().expect("lock delivered").push(values.to_vec());
        })
    }

    fn completion_callback(&self) -> CompletionCallback {
        let terminal = self.terminal.clone();
        Arc::new(move |state: &LifecycleState| {
            terminal.lock().expect("lock terminal").push(state.clone());
        })
    }

    fn delivered_count(&self) -> usize {
        self.delivered.lock().expect("lock delivered").len()
    }

    fn terminal_states(&self) -> Vec<LifecycleState> {
        self.terminal.lock().expect("lock terminal").clone()
    }
}

async fn configured_measurement(
    client: &MeasurementPlaneClient,
    callbacks: &Callbacks,
) -> Measurement {
    let measurement = client.create_measurement(capability());
    let accepted = measurement
        .configure(
            "now | 2s",
            json!({"channels": [1, 2, 3]}),
            callbacks.result_callback(),
            Default::default(),
            Some(callbacks.completion_callback()),
        )
        .await;
    assert!(accepted);
    assert_eq!(measurement.state().await, LifecycleState::Configured);
    measurement
}

#[tokio::test]
async fn configure_with_violating_parameters_stays_created() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let transport: Arc<dyn Transport> = broker.clone();
    let client = MeasurementPlaneClient::new(
        "reject-test",
        ClientConfig::default(),
        transport,
        Arc::new(RejectAllValidator),
    );
    let callbacks = Callbacks::new();

    let measurement = client.create_measurement(capability());
    let accepted = measurement
        .configure(
            "now | 2s",
            json!({"channels": [1]}),
            callbacks.result_callback(),
            Default::default(),
            None,
        )
        .await;

    assert!(!accepted);
    assert_eq!(measurement.state().await, LifecycleState::Created);
    assert!(broker.published_on("topic:///specifications").await.is_empty());
}

#[tokio::test]
async fn configure_gates_on_the_declared_parameter_schema() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = client.create_measurement(capability());
    let rejected = measurement
        .configure(
            "now | 2s",
            json!({"wrong_key": true}),
            callbacks.result_callback(),
            Default::default(),
            None,
        )
        .await;
    assert!(!rejected);
    assert_eq!(measurement.state().await, LifecycleState::Created);

    let accepted = measurement
        .configure(
            "now | 2s",
            json!({"channels": [1, 2, 3]}),
            callbacks.result_callback(),
            Default::default(),
            None,
        )
        .await;
    assert!(accepted);
    assert_eq!(measurement.state().await, LifecycleState::Configured);
}

#[tokio::test]
async fn unacknowledged_submission_fails_and_never_subscribes_to_results() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let _agent = ScriptedAgent::start(broker.clone(), None, AckMode::Silent).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");

    assert_eq!(
        measurement.state().await,
        LifecycleState::Failed(FailureCause::NoAcknowledgment)
    );
    let measurement_id = measurement
        .measurement_id()
        .await
        .expect("configured measurement has an id");
    assert_eq!(
        broker.subscriber_count(&results_topic(&measurement_id)).await,
        0
    );
    assert_eq!(
        callbacks.terminal_states(),
        vec![LifecycleState::Failed(FailureCause::NoAcknowledgment)]
    );
}

#[tokio::test]
async fn malformed_receipt_fails_the_measurement() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let _agent = ScriptedAgent::start(broker.clone(), None, AckMode::Malformed).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");

    assert_eq!(
        measurement.state().await,
        LifecycleState::Failed(FailureCause::UnusableReceipt)
    );
}

#[tokio::test]
async fn interrupt_flagged_receipt_terminates_without_a_result_subscription() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let _agent =
        ScriptedAgent::start(broker.clone(), None, AckMode::AcknowledgeInterrupt).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");

    assert_eq!(measurement.state().await, LifecycleState::Interrupted);
    let measurement_id = measurement.measurement_id().await.expect("id");
    assert_eq!(
        broker.subscriber_count(&results_topic(&measurement_id)).await,
        0
    );
}

#[tokio::test]
async fn result_stream_accumulates_batches_and_completes_on_the_sentinel() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let agent = ScriptedAgent::start(broker.clone(), None, AckMode::Acknowledge).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");
    assert_eq!(measurement.state().await, LifecycleState::Streaming);

    let measurement_id = measurement.measurement_id().await.expect("id");
    agent.publish_results(&measurement_id, json!([1, 2])).await;
    agent
        .publish_results(&measurement_id, json!([EOF_SENTINEL]))
        .await;

    assert!(
        wait_for_state(&measurement, &LifecycleState::Completed, Duration::from_secs(2)).await
    );

    // Two deliveries, one accumulated batch: the sentinel is never stored.
    assert_eq!(callbacks.delivered_count(), 2);
    assert_eq!(measurement.results().await, vec![json!([1, 2])]);
    assert_eq!(
        broker.subscriber_count(&results_topic(&measurement_id)).await,
        0
    );
    assert_eq!(callbacks.terminal_states(), vec![LifecycleState::Completed]);
}

#[tokio::test]
async fn undecodable_and_foreign_payloads_are_dropped_without_state_change() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let agent = ScriptedAgent::start(broker.clone(), None, AckMode::Acknowledge).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");
    let measurement_id = measurement.measurement_id().await.expect("id");
    let topic = results_topic(&measurement_id);

    // Undecodable bytes, then a shape that is no result batch.
    broker.publish_untagged(&topic, vec![0xc1]).await;
    broker
        .publish_untagged(&topic, b"{\"receipt\": true}".to_vec())
        .await;
    agent.publish_results(&measurement_id, json!([7])).await;

    assert!(
        eventually(Duration::from_secs(2), || callbacks.delivered_count() == 1).await
    );
    assert_eq!(measurement.state().await, LifecycleState::Streaming);
    assert_eq!(measurement.results().await, vec![json!([7])]);
}

#[tokio::test]
async fn result_batches_arrive_in_either_wire_encoding() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let _agent = ScriptedAgent::start(broker.clone(), None, AckMode::Acknowledge).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");
    let measurement_id = measurement.measurement_id().await.expect("id");
    let topic = results_topic(&measurement_id);

    // Tagged MessagePack batch.
    let batch = json!({"result": true, "resultValues": [1]});
    let payload =
        codec::encode(&batch, PayloadEncoding::MessagePack).expect("encode msgpack");
    broker
        .publish(&topic, OutboundMessage::tagged(payload, PayloadEncoding::MessagePack))
        .await
        .expect("publish msgpack batch");

    // Untagged MessagePack batch, found by the fallback trial.
    let batch = json!({"result": true, "resultValues": [2]});
    let payload =
        codec::encode(&batch, PayloadEncoding::MessagePack).expect("encode msgpack");
    broker.publish_untagged(&topic, payload).await;

    assert!(
        eventually(Duration::from_secs(2), || callbacks.delivered_count() == 2).await
    );
    assert_eq!(
        measurement.results().await,
        vec![json!([1]), json!([2])]
    );
}

#[tokio::test]
async fn interrupt_stops_delivery_and_reuses_the_measurement_identity() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let agent = ScriptedAgent::start(broker.clone(), None, AckMode::Acknowledge).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");
    let measurement_id = measurement.measurement_id().await.expect("id");

    agent.publish_results(&measurement_id, json!([1, 2])).await;
    assert!(
        eventually(Duration::from_secs(2), || callbacks.delivered_count() == 1).await
    );

    client
        .interrupt_measurement(&measurement)
        .await
        .expect("interrupt runs");
    assert_eq!(measurement.state().await, LifecycleState::Interrupted);

    // No further callback fires after interrupt() returns, even for
    // messages already in flight.
    let delivered_at_interrupt = callbacks.delivered_count();
    agent.publish_results(&measurement_id, json!([3, 4])).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(callbacks.delivered_count(), delivered_at_interrupt);
    assert_eq!(
        broker.subscriber_count(&results_topic(&measurement_id)).await,
        0
    );

    // The interrupt request shares every identity field with the original
    // submission, differing only in mode.
    let specifications = agent.received_specifications().await;
    assert_eq!(specifications.len(), 2);
    let original: Specification =
        serde_json::from_value(specifications[0].clone()).expect("original specification");
    let interrupt: Specification =
        serde_json::from_value(specifications[1].clone()).expect("interrupt specification");
    assert_eq!(specifications[0]["mode"], "specification");
    assert_eq!(specifications[1]["mode"], "interrupt");
    assert_eq!(original.measurement_id(), interrupt.measurement_id());
    assert_eq!(original.parameters, interrupt.parameters);
    assert_eq!(original.schedule, interrupt.schedule);

    assert_eq!(callbacks.terminal_states(), vec![LifecycleState::Interrupted]);
}

#[tokio::test]
async fn interrupt_before_submission_is_refused_locally() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .interrupt_measurement(&measurement)
        .await
        .expect("interrupt runs");

    // Nothing in flight: no interrupt specification reaches the wire.
    assert_eq!(measurement.state().await, LifecycleState::Configured);
    assert!(broker.published_on("topic:///specifications").await.is_empty());
}

#[tokio::test]
async fn interrupt_on_a_terminal_measurement_is_idempotent() {
    init_tracing();
    let broker = Arc::new(LoopbackBroker::new());
    let agent = ScriptedAgent::start(broker.clone(), None, AckMode::Acknowledge).await;
    let client = client(&broker);
    let callbacks = Callbacks::new();

    let measurement = configured_measurement(&client, &callbacks).await;
    client
        .send_measurement(&measurement)
        .await
        .expect("submission runs");
    let measurement_id = measurement.measurement_id().await.expect("id");
    agent
        .publish_results(&measurement_id, json!([EOF_SENTINEL]))
        .await;
    assert!(
        wait_for_state(&measurement, &LifecycleState::Completed, Duration::from_secs(2)).await
    );

    client
        .interrupt_measurement(&measurement)
        .await
        .expect("interrupt runs");
    assert_eq!(measurement.state().await, LifecycleState::Completed);
    assert_eq!(callbacks.terminal_states(), vec![LifecycleState::Completed]);
    // Only the original submission reached the wire.
    assert_eq!(agent.received_specifications().await.len(), 1);
}
