//! Capability directory lookup over the discovery topic.

use crate::correlation::rendezvous::RendezvousChannel;
use crate::observability::events;
use crate::transport::{OutboundMessage, Transport, TransportError};
use crate::wire::codec::{self, PayloadEncoding};
use crate::wire::envelope::{classify, Capability, InboundEnvelope};
use crate::wire::identifiers::CapabilityId;
use crate::wire::topics::DISCOVERY_TOPIC;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const COMPONENT: &str = "capability_directory";

/// Fetches the currently advertised capability set.
pub(crate) struct CapabilityDirectory {
    rendezvous: RendezvousChannel,
    lookup_timeout: Duration,
}

impl CapabilityDirectory {
    pub(crate) fn new(transport: Arc<dyn Transport>, lookup_timeout: Duration) -> Self {
        Self {
            rendezvous: RendezvousChannel::new(transport),
            lookup_timeout,
        }
    }

    /// One discovery round trip. `kind_filter`, when supplied, keeps only
    /// capabilities whose kind is listed. A malformed or absent reply is a
    /// temporarily empty directory, never an error; retries are the caller's
    /// business.
    pub(crate) async fn list_capabilities(
        &self,
        kind_filter: Option<&[&str]>,
    ) -> Result<HashMap<CapabilityId, Capability>, TransportError> {
        let request = OutboundMessage::tagged(Vec::new(), PayloadEncoding::Json);
        let reply = self
            .rendezvous
            .call(DISCOVERY_TOPIC, request, self.lookup_timeout)
            .await?;

        let Some(reply) = reply else {
            debug!(
                event = events::DIRECTORY_EMPTY,
                component = COMPONENT,
                reason = "no_reply",
                "no directory reply within bound"
            );
            return Ok(HashMap::new());
        };

        let value = match codec::decode(&reply.payload, reply.encoding) {
            Ok(value) => value,
            Err(failure) => {
                warn!(
                    event = events::DIRECTORY_EMPTY,
                    component = COMPONENT,
                    reason = "undecodable_reply",
                    err = %failure,
                    "directory reply not decodable"
                );
                return Ok(HashMap::new());
            }
        };

        let InboundEnvelope::CapabilitySet(advertised) = classify(&value) else {
            warn!(
                event = events::DIRECTORY_EMPTY,
                component = COMPONENT,
                reason = "unexpected_shape",
                "directory reply did not carry a capability set"
            );
            return Ok(HashMap::new());
        };

        let mut capabilities = HashMap::new();
        for (advertised_id, mut capability) in advertised {
            let derived_id = capability.derived_id();
            if advertised_id != derived_id {
                warn!(
                    event = events::DIRECTORY_ID_MISMATCH,
                    component = COMPONENT,
                    advertised_id = %advertised_id,
                    derived_id = %derived_id,
                    "advertised capability id does not match locally derived id"
                );
            }
            if let Some(kinds) = kind_filter {
                if !kinds.contains(&capability.capability_kind.as_str()) {
                    continue;
                }
            }
            capability.id = derived_id.clone();
            capabilities.insert(derived_id, capability);
        }
        Ok(capabilities)
    }
}
