//! SIP control plane.
//!
//! Only the contract is owned here; the HTTP implementation talks to the
//! media plane's SIP service (LiveKit-style twirp endpoints). A scripted
//! implementation backs the orchestrator tests.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::TelephonyError;

/// Request to dial a phone number into a room.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundSipRequest {
    pub room_name: String,
    pub phone_number: String,
    pub participant_identity: String,
    pub trunk_id: String,
    pub ringing_timeout: Duration,
    pub max_call_duration: Duration,
}

/// Handle to a created SIP participant.
#[derive(Debug, Clone, Deserialize)]
pub struct SipParticipantHandle {
    pub participant_id: String,
    pub sip_call_id: String,
}

/// Control plane operations the orchestrator needs.
#[async_trait]
pub trait SipControlPlane: Send + Sync {
    /// Create an outbound SIP participant (starts ringing).
    async fn create_sip_participant(
        &self,
        request: &OutboundSipRequest,
    ) -> Result<SipParticipantHandle, TelephonyError>;

    /// Drop a participant (hangup).
    async fn remove_participant(
        &self,
        room_name: &str,
        participant_identity: &str,
    ) -> Result<(), TelephonyError>;

    /// Tear down a room after the call.
    async fn delete_room(&self, room_name: &str) -> Result<(), TelephonyError>;
}

/// HTTP implementation against the media plane's SIP API.
pub struct HttpSipControlPlane {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl HttpSipControlPlane {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, TelephonyError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .json(body)
            .send()
            .await
            .map_err(|e| TelephonyError::ControlPlane(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelephonyError::ControlPlane(format!("{status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| TelephonyError::ControlPlane(e.to_string()))
    }
}

#[async_trait]
impl SipControlPlane for HttpSipControlPlane {
    async fn create_sip_participant(
        &self,
        request: &OutboundSipRequest,
    ) -> Result<SipParticipantHandle, TelephonyError> {
        #[derive(Serialize)]
        struct Body<'a> {
            sip_trunk_id: &'a str,
            sip_call_to: &'a str,
            room_name: &'a str,
            participant_identity: &'a str,
            ringing_timeout_secs: u64,
            max_call_duration_secs: u64,
        }
        #[derive(Deserialize)]
        struct Response {
            participant_id: String,
            #[serde(default)]
            sip_call_id: String,
        }

        let response: Response = self
            .post(
                "/twirp/livekit.SIP/CreateSIPParticipant",
                &Body {
                    sip_trunk_id: &request.trunk_id,
                    sip_call_to: &request.phone_number,
                    room_name: &request.room_name,
                    participant_identity: &request.participant_identity,
                    ringing_timeout_secs: request.ringing_timeout.as_secs(),
                    max_call_duration_secs: request.max_call_duration.as_secs(),
                },
            )
            .await?;

        Ok(SipParticipantHandle {
            participant_id: response.participant_id,
            sip_call_id: response.sip_call_id,
        })
    }

    async fn remove_participant(
        &self,
        room_name: &str,
        participant_identity: &str,
    ) -> Result<(), TelephonyError> {
        #[derive(Serialize)]
        struct Body<'a> {
            room: &'a str,
            identity: &'a str,
        }
        let _: serde_json::Value = self
            .post(
                "/twirp/livekit.RoomService/RemoveParticipant",
                &Body {
                    room: room_name,
                    identity: participant_identity,
                },
            )
            .await?;
        Ok(())
    }

    async fn delete_room(&self, room_name: &str) -> Result<(), TelephonyError> {
        #[derive(Serialize)]
        struct Body<'a> {
            room: &'a str,
        }
        let _: serde_json::Value = self
            .post("/twirp/livekit.RoomService/DeleteRoom", &Body { room: room_name })
            .await?;
        Ok(())
    }
}

pub mod testing {
    //! Scripted control plane used by orchestrator and server tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct ScriptedControlPlane {
        pub created: Mutex<Vec<OutboundSipRequest>>,
        pub fail_create: bool,
    }

    #[async_trait]
    impl SipControlPlane for ScriptedControlPlane {
        async fn create_sip_participant(
            &self,
            request: &OutboundSipRequest,
        ) -> Result<SipParticipantHandle, TelephonyError> {
            if self.fail_create {
                return Err(TelephonyError::ControlPlane("trunk unavailable".into()));
            }
            self.created.lock().push(request.clone());
            Ok(SipParticipantHandle {
                participant_id: format!("PA_{}", self.created.lock().len()),
                sip_call_id: "SCL_1".to_string(),
            })
        }

        async fn remove_participant(
            &self,
            _room_name: &str,
            _participant_identity: &str,
        ) -> Result<(), TelephonyError> {
            Ok(())
        }

        async fn delete_room(&self, _room_name: &str) -> Result<(), TelephonyError> {
            Ok(())
        }
    }
}
