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

//! # mplane-client
//!
//! `mplane-client` implements the client side of a measurement-plane control
//! protocol: discover remotely advertised measurement capabilities, submit a
//! parameterized specification, correlate its asynchronous receipt over an
//! ephemeral reply topic, stream result batches until an in-band
//! end-of-stream marker, and interrupt an in-flight measurement — all over a
//! publish/subscribe transport supplied by the embedder.
//!
//! Typical usage is API-first and centered on [`MeasurementPlaneClient`] and
//! [`Measurement`]. Internal modules are organized by domain layer to keep
//! behavior ownership explicit.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use integration_test_utils::{AcceptAllValidator, LoopbackBroker};
//! use mplane_client::{ClientConfig, MeasurementPlaneClient, Transport};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let broker = Arc::new(LoopbackBroker::new());
//! let transport: Arc<dyn Transport> = broker.clone();
//!
//! let config = ClientConfig {
//!     discovery_timeout: Duration::from_millis(50),
//!     ..ClientConfig::default()
//! };
//! let client = MeasurementPlaneClient::new(
//!     "quick-start",
//!     config,
//!     transport,
//!     Arc::new(AcceptAllValidator),
//! );
//!
//! // Nobody advertises on an empty broker: the directory comes back empty.
//! let capabilities = client.list_capabilities(None).await.unwrap();
//! assert!(capabilities.is_empty());
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - Client facade: outward [`MeasurementPlaneClient`] surface
//! - Correlation: rendezvous request/ephemeral-reply exchange,
//!   subscribe-before-publish ordering
//! - Discovery: capability directory lookup and kind filtering
//! - Lifecycle: measurement state machine, receipt handling, result-stream
//!   worker, interrupt path
//! - Wire: topic plan, identifier derivation, dual-path codec, envelope
//!   classification
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events. Library code emits
//! events/spans and does not unconditionally initialize a global subscriber.
//! Binaries and tests are responsible for one-time `tracing_subscriber`
//! initialization at process boundaries.

mod client;
pub use client::{ClientConfig, ClientError, MeasurementPlaneClient};

mod correlation;
mod discovery;

pub mod lifecycle;
pub use lifecycle::measurement::{
    CompletionCallback, DeliveryOptions, Measurement, ResultCallback,
};
pub use lifecycle::state::{FailureCause, LifecycleState};

mod observability;

pub mod transport;
pub use transport::{
    InboundMessage, OutboundMessage, SubscriptionHandle, TopicListener, Transport,
    TransportError,
};

pub mod validate;
pub use validate::{SchemaValidator, ValidationError};

pub mod wire;
pub use wire::codec::{DecodeFailure, PayloadEncoding};
pub use wire::envelope::{
    Capability, InboundEnvelope, Receipt, ResultBatch, Specification, SpecificationMode,
    EOF_SENTINEL,
};
pub use wire::identifiers::{capability_id, measurement_id, CapabilityId, MeasurementId};
