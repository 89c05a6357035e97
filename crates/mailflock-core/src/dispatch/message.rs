//! Wire types exchanged over the `campaigns` and `send_bulk` topics

use mailflock_common::types::{CampaignId, SegmentId, UserId};
use mailflock_storage::Campaign;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Mail provider credentials forwarded to the bulk sender
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SesKeys {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Request consumed by the campaigner from the `campaigns` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCampaignParams {
    pub segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub template_data: BTreeMap<String, String>,
    pub source: String,
    pub user_id: UserId,
    pub user_uuid: String,
    #[serde(default)]
    pub configuration_set_exists: bool,
    pub campaign: Campaign,
    /// Absent when the bulk sender should use its own credentials
    #[serde(default)]
    pub ses_keys: Option<SesKeys>,
}

/// One dispatch unit published to the `send_bulk` topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSendMessage {
    #[serde(rename = "msg_uuid")]
    pub uuid: Uuid,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub ses_keys: Option<SesKeys>,
    pub input: BulkTemplatedEmailInput,
}

impl BulkSendMessage {
    /// Every recipient address in the message
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.input
            .destinations
            .iter()
            .flat_map(|d| d.destination.to_addresses.iter().map(String::as_str))
    }
}

/// Provider bulk templated email request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BulkTemplatedEmailInput {
    pub source: String,
    pub template: String,
    /// JSON object used when a destination has no replacement value
    pub default_template_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_set_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_tags: Vec<MessageTag>,
    pub destinations: Vec<BulkEmailDestination>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BulkEmailDestination {
    pub destination: Destination,
    /// JSON object merged over the default template data
    pub replacement_template_data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Destination {
    pub to_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageTag {
    pub name: String,
    pub value: String,
}

impl MessageTag {
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_bulk_message_wire_names() {
        let message = BulkSendMessage {
            uuid: Uuid::nil(),
            user_id: 7,
            campaign_id: 3,
            ses_keys: None,
            input: BulkTemplatedEmailInput {
                source: "news@example.com".to_string(),
                template: "welcome".to_string(),
                default_template_data: "{}".to_string(),
                configuration_set_name: None,
                default_tags: vec![MessageTag::new("campaign_id", 3)],
                destinations: vec![BulkEmailDestination {
                    destination: Destination {
                        to_addresses: vec!["a@example.com".to_string()],
                    },
                    replacement_template_data: "{}".to_string(),
                }],
            },
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["msg_uuid"], json!(Uuid::nil().to_string()));
        assert_eq!(value["input"]["Template"], json!("welcome"));
        assert_eq!(
            value["input"]["Destinations"][0]["Destination"]["ToAddresses"],
            json!(["a@example.com"])
        );
        assert_eq!(
            value["input"]["DefaultTags"],
            json!([{"Name": "campaign_id", "Value": "3"}])
        );
        assert!(value["input"].get("ConfigurationSetName").is_none());
        assert_eq!(message.recipients().collect::<Vec<_>>(), vec!["a@example.com"]);
    }
}
