//! Participant classification.
//!
//! A joining participant is a SIP participant iff its kind says so or its
//! identity carries the SIP prefix. SIP participants bring caller and
//! destination numbers, the provider call id and the call direction in
//! their attributes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callbridge_config::constants::telephony::SIP_IDENTITY_PREFIX;

/// How the caller reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Inbound,
    Outbound,
    Web,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Web => "web",
        }
    }
}

/// A participant join event as delivered by the media plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantInfo {
    pub identity: String,
    /// Participant kind as reported (e.g. `standard`, `sip`).
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Option<String>,
}

/// Telephony attributes of a SIP participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelephonyAttributes {
    pub caller_phone_number: String,
    pub destination_phone_number: String,
    pub call_sid: String,
    pub call_direction: String,
}

/// Classification outcome.
#[derive(Debug, Clone)]
pub struct Classification {
    pub call_type: CallType,
    pub is_telephony: bool,
    pub telephony: Option<TelephonyAttributes>,
}

fn attr<'a>(attributes: &'a HashMap<String, String>, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|k| attributes.get(*k))
        .map(String::as_str)
        .unwrap_or("")
}

/// Classify one joining participant.
pub fn classify_participant(participant: &ParticipantInfo) -> Classification {
    let is_sip = participant.kind.eq_ignore_ascii_case("sip")
        || participant.identity.starts_with(SIP_IDENTITY_PREFIX);

    if !is_sip {
        return Classification {
            call_type: CallType::Web,
            is_telephony: false,
            telephony: None,
        };
    }

    let direction = attr(&participant.attributes, &["sip.direction", "sip.callDirection"]);
    let call_type = if direction.eq_ignore_ascii_case("outbound") {
        CallType::Outbound
    } else {
        CallType::Inbound
    };

    let telephony = TelephonyAttributes {
        caller_phone_number: attr(
            &participant.attributes,
            &["sip.from", "sip.phoneNumber", "sip.caller"],
        )
        .to_string(),
        destination_phone_number: attr(
            &participant.attributes,
            &["sip.to", "sip.trunkPhoneNumber", "sip.destination"],
        )
        .to_string(),
        call_sid: attr(&participant.attributes, &["sip.callSid", "sip.callID"]).to_string(),
        call_direction: if direction.is_empty() {
            "inbound".to_string()
        } else {
            direction.to_lowercase()
        },
    };

    Classification {
        call_type,
        is_telephony: true,
        telephony: Some(telephony),
    }
}

/// Greeting for a call type, with the agent's own greeting taking
/// precedence when set.
pub fn greeting_for(call_type: CallType, agent_greeting: Option<&str>) -> String {
    if let Some(greeting) = agent_greeting {
        let trimmed = greeting.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    match call_type {
        CallType::Inbound => "Thank you for calling. How may I help you today?".to_string(),
        CallType::Outbound => {
            "Hello! I am calling on behalf of our team. Is this a good time to talk?".to_string()
        }
        CallType::Web => "Hi there! How can I help you today?".to_string(),
    }
}
