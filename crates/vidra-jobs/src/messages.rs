//! Queue message payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message on the `download` queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadMessage {
    /// Job the download belongs to.
    pub job_id: Uuid,
    /// Magnet URI to resolve and download.
    pub magnet_uri: String,
    /// Delivery priority, 1..=10 (higher first).
    pub priority: i16,
}

/// Message on the `conversion` queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionMessage {
    /// Job the conversion belongs to.
    pub job_id: Uuid,
    /// Path of the downloaded artifact to inspect and convert.
    pub input_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_message_round_trips_through_json() {
        let message = DownloadMessage {
            job_id: Uuid::new_v4(),
            magnet_uri: "magnet:?xt=urn:btih:0000000000000000000000000000000000000000"
                .to_string(),
            priority: 7,
        };
        let value = serde_json::to_value(&message).unwrap();
        let restored: DownloadMessage = serde_json::from_value(value).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn conversion_message_round_trips_through_json() {
        let message = ConversionMessage {
            job_id: Uuid::new_v4(),
            input_path: "/var/lib/vidra/videos/j/feature.mkv".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        let restored: ConversionMessage = serde_json::from_value(value).unwrap();
        assert_eq!(restored, message);
    }
}
