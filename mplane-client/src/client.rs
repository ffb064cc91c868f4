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

//! Outward client facade for one measurement-plane session.

use crate::discovery::directory::CapabilityDirectory;
use crate::lifecycle::measurement::Measurement;
use crate::lifecycle::state::LifecycleState;
use crate::transport::{Transport, TransportError};
use crate::validate::SchemaValidator;
use crate::wire::envelope::Capability;
use crate::wire::identifiers::CapabilityId;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CLIENT_TAG: &str = "MeasurementPlaneClient:";
const CLIENT_FN_NEW_TAG: &str = "new():";
const CLIENT_FN_LIST_CAPABILITIES_TAG: &str = "list_capabilities():";
const CLIENT_FN_SEND_MEASUREMENT_TAG: &str = "send_measurement():";
const CLIENT_FN_INTERRUPT_MEASUREMENT_TAG: &str = "interrupt_measurement():";

/// Bounds and queue sizing for one client session.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on the discovery rendezvous.
    pub discovery_timeout: Duration,
    /// Bound on the receipt rendezvous for submissions and interrupts.
    pub receipt_timeout: Duration,
    /// Consumer queue depth for each result stream.
    pub result_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(2),
            receipt_timeout: Duration::from_secs(2),
            result_queue_size: 16,
        }
    }
}

/// Errors surfaced by client operations. A rendezvous timeout is not one of
/// them: it lands in measurement state or an empty directory instead.
#[derive(Debug)]
pub enum ClientError {
    /// The measurement has no accepted configuration yet.
    NotConfigured,
    /// The operation is not legal in the measurement's current state.
    InvalidState(LifecycleState),
    /// A request body could not be encoded.
    Encode(String),
    /// The transport rejected an operation.
    Transport(TransportError),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConfigured => write!(f, "measurement is not configured"),
            ClientError::InvalidState(state) => {
                write!(f, "operation not legal in state: {state}")
            }
            ClientError::Encode(detail) => write!(f, "unable to encode request: {detail}"),
            ClientError::Transport(transport_error) => write!(f, "{transport_error}"),
        }
    }
}

impl Error for ClientError {}

impl From<TransportError> for ClientError {
    fn from(transport_error: TransportError) -> Self {
        ClientError::Transport(transport_error)
    }
}

/// Client-side engine for one measurement-plane session.
///
/// Holds the transport session object explicitly; nothing in this crate is
/// process-global.
pub struct MeasurementPlaneClient {
    name: String,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    validator: Arc<dyn SchemaValidator>,
    directory: CapabilityDirectory,
}

impl MeasurementPlaneClient {
    pub fn new(
        name: &str,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Self {
        let name = format!("{CLIENT_TAG}{name}:");
        debug!("{}:{} client session created", &name, CLIENT_FN_NEW_TAG);
        Self {
            directory: CapabilityDirectory::new(transport.clone(), config.discovery_timeout),
            name,
            config,
            transport,
            validator,
        }
    }

    /// Fetches the currently advertised capabilities, optionally narrowed to
    /// the listed kinds. Each call is a fresh rendezvous; an unreachable or
    /// silent directory comes back empty.
    pub async fn list_capabilities(
        &self,
        kind_filter: Option<&[&str]>,
    ) -> Result<HashMap<CapabilityId, Capability>, ClientError> {
        debug!(
            "{}:{} fetching capability directory",
            self.name, CLIENT_FN_LIST_CAPABILITIES_TAG
        );
        let capabilities = self.directory.list_capabilities(kind_filter).await?;
        debug!(
            "{}:{} directory holds {} capabilities",
            self.name,
            CLIENT_FN_LIST_CAPABILITIES_TAG,
            capabilities.len()
        );
        Ok(capabilities)
    }

    /// Instantiates a measurement session from one advertised capability.
    /// The session is owned by the caller; this client keeps no reference.
    pub fn create_measurement(&self, capability: Capability) -> Measurement {
        Measurement::new(
            capability,
            self.transport.clone(),
            self.validator.clone(),
            self.config.receipt_timeout,
            self.config.result_queue_size,
        )
    }

    /// Submits a configured measurement and correlates its receipt. The
    /// outcome is recorded on the measurement state; an absent receipt
    /// leaves it `Failed`, not this call.
    pub async fn send_measurement(&self, measurement: &Measurement) -> Result<(), ClientError> {
        debug!(
            "{}:{} submitting specification",
            self.name, CLIENT_FN_SEND_MEASUREMENT_TAG
        );
        measurement.submit().await
    }

    /// Best-effort cancellation of an in-flight measurement.
    pub async fn interrupt_measurement(
        &self,
        measurement: &Measurement,
    ) -> Result<(), ClientError> {
        debug!(
            "{}:{} interrupting measurement",
            self.name, CLIENT_FN_INTERRUPT_MEASUREMENT_TAG
        );
        measurement.interrupt().await
    }
}
