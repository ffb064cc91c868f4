//! Topic-name plan shared with remote measurement agents.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Well-known discovery request topic; fixed string, part of the wire
/// contract.
pub const DISCOVERY_TOPIC: &str = "topic:///get_capabilities";

/// Well-known submission request topic for specifications and interrupts.
pub const SUBMISSION_TOPIC: &str = "topic:///specifications";

const TOPIC_SCHEME: &str = "topic://";
const REPLY_SUFFIX_LEN: usize = 10;

/// Result-stream topic for one measurement.
pub fn results_topic(measurement_id: &str) -> String {
    format!("{TOPIC_SCHEME}{measurement_id}/results")
}

/// Fresh, effectively-unique reply topic for one rendezvous call.
pub fn fresh_reply_topic() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REPLY_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{TOPIC_SCHEME}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::{fresh_reply_topic, results_topic, REPLY_SUFFIX_LEN, TOPIC_SCHEME};
    use std::collections::HashSet;

    #[test]
    fn results_topic_embeds_measurement_id() {
        assert_eq!(results_topic("abc123"), "topic://abc123/results");
    }

    #[test]
    fn reply_topics_carry_scheme_and_alphanumeric_suffix() {
        let topic = fresh_reply_topic();
        let suffix = topic.strip_prefix(TOPIC_SCHEME).expect("topic scheme");
        assert_eq!(suffix.len(), REPLY_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn reply_topics_are_effectively_unique() {
        let drawn: HashSet<String> = (0..100).map(|_| fresh_reply_topic()).collect();
        assert_eq!(drawn.len(), 100);
    }
}
