//! The call orchestrator.
//!
//! Sole writer of the active-calls map. Inbound participants are
//! classified and admitted; outbound calls are validated, admitted,
//! placed through the control plane and watched for ring timeout and the
//! call duration cap. Lifecycle is broadcast through the platform event
//! broker; latency breaches ride the same channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use callbridge_config::constants::telephony;
use callbridge_core::{
    normalize_phone_number, EventBroker, LatencyEvent, LatencyTargets, LatencyTracker, Operation,
    PlatformEvent,
};

use crate::classify::{classify_participant, CallType, Classification, ParticipantInfo};
use crate::control::{OutboundSipRequest, SipControlPlane};
use crate::rooms::room_name;
use crate::TelephonyError;

/// Outbound call request from the API layer.
#[derive(Debug, Clone)]
pub struct OutboundCallRequest {
    pub organization_id: String,
    pub agent_id: String,
    pub phone_number: String,
    pub room_name: Option<String>,
    pub ring_timeout: Option<Duration>,
    pub metadata: Option<Value>,
}

/// Outbound call placement result.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundCallResult {
    pub call_id: String,
    pub room_name: String,
    pub sip_participant_id: String,
    pub state: CallState,
    pub initiated_at: DateTime<Utc>,
}

/// Active call states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ringing,
    Connected,
    Disconnected,
    Failed,
}

struct ActiveCall {
    session_id: String,
    organization_id: String,
    agent_id: String,
    room_name: String,
    call_type: CallType,
    state: CallState,
    latency: Arc<LatencyTracker>,
    started_at: DateTime<Utc>,
    sip_participant_id: Option<String>,
}

/// Read-only view of an active call.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCallView {
    pub session_id: String,
    pub organization_id: String,
    pub agent_id: String,
    pub room_name: String,
    pub call_type: CallType,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub sip_participant_id: Option<String>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_calls: usize,
    pub ring_timeout: Duration,
    pub max_call_duration: Duration,
    pub sip_trunk_id: String,
    pub latency_targets: LatencyTargets,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: telephony::MAX_CONCURRENT_CALLS,
            ring_timeout: Duration::from_secs(telephony::RING_TIMEOUT_SECS),
            max_call_duration: Duration::from_secs(telephony::MAX_CALL_DURATION_SECS),
            sip_trunk_id: String::new(),
            latency_targets: LatencyTargets::default(),
        }
    }
}

/// Call orchestrator.
pub struct CallOrchestrator {
    control: Arc<dyn SipControlPlane>,
    broker: Arc<EventBroker>,
    active: DashMap<String, ActiveCall>,
    config: OrchestratorConfig,
    /// Gate flipped during graceful shutdown: no new calls admitted.
    accepting: std::sync::atomic::AtomicBool,
    /// Back-reference for the watchdog tasks this orchestrator spawns.
    this: Weak<CallOrchestrator>,
}

impl CallOrchestrator {
    pub fn new(
        control: Arc<dyn SipControlPlane>,
        broker: Arc<EventBroker>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            control,
            broker,
            active: DashMap::new(),
            config,
            accepting: std::sync::atomic::AtomicBool::new(true),
            this: this.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("orchestrator outlives its tasks")
    }

    /// Stop admitting new calls (graceful shutdown).
    pub fn stop_accepting(&self) {
        self.accepting
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_admission(&self) -> Result<(), TelephonyError> {
        if !self.accepting.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TelephonyError::Admission(self.active.len()));
        }
        if self.active.len() >= self.config.max_concurrent_calls {
            metrics::counter!("callbridge_calls_rejected_admission").increment(1);
            return Err(TelephonyError::Admission(self.active.len()));
        }
        Ok(())
    }

    /// Register a joining participant as an active call.
    ///
    /// Returns the classification plus the session id and per-call
    /// latency tracker the voice session should use.
    pub fn handle_participant_joined(
        &self,
        room: &str,
        participant: &ParticipantInfo,
    ) -> Result<(String, Classification, Arc<LatencyTracker>), TelephonyError> {
        self.check_admission()?;
        let classification = classify_participant(participant);
        let session_id = Uuid::new_v4().to_string();
        let (organization_id, agent_id) =
            crate::rooms::parse_room_name(room).unwrap_or_default();

        let latency = Arc::new(LatencyTracker::new(
            session_id.clone(),
            self.config.latency_targets.clone(),
        ));
        self.watch_latency(&session_id, &latency);

        self.active.insert(
            session_id.clone(),
            ActiveCall {
                session_id: session_id.clone(),
                organization_id,
                agent_id,
                room_name: room.to_string(),
                call_type: classification.call_type,
                state: CallState::Connected,
                latency: latency.clone(),
                started_at: Utc::now(),
                sip_participant_id: None,
            },
        );
        self.spawn_duration_cap(session_id.clone());

        self.broker.publish(PlatformEvent::CallStarted {
            session_id: session_id.clone(),
            agent_id: self.active.get(&session_id).map(|c| c.agent_id.clone()),
            call_type: classification.call_type.as_str().to_string(),
        });
        metrics::counter!(
            "callbridge_calls_started",
            "call_type" => classification.call_type.as_str()
        )
        .increment(1);

        Ok((session_id, classification, latency))
    }

    /// Place an outbound SIP call.
    pub async fn place_outbound_call(
        &self,
        request: OutboundCallRequest,
    ) -> Result<OutboundCallResult, TelephonyError> {
        let phone_number = normalize_phone_number(&request.phone_number).ok_or_else(|| {
            TelephonyError::Validation(format!(
                "phone number {:?} is not E.164",
                request.phone_number
            ))
        })?;
        self.check_admission()?;

        let session_id = Uuid::new_v4().to_string();
        let room = request
            .room_name
            .clone()
            .unwrap_or_else(|| room_name(&request.organization_id, &request.agent_id));
        let ring_timeout = request.ring_timeout.unwrap_or(self.config.ring_timeout);

        let latency = Arc::new(LatencyTracker::new(
            session_id.clone(),
            self.config.latency_targets.clone(),
        ));
        self.watch_latency(&session_id, &latency);
        let sip_handle = latency.start(Operation::SipConnect);

        let sip_request = OutboundSipRequest {
            room_name: room.clone(),
            phone_number: phone_number.clone(),
            participant_identity: format!("sip_out_{session_id}"),
            trunk_id: self.config.sip_trunk_id.clone(),
            ringing_timeout: ring_timeout,
            max_call_duration: self.config.max_call_duration,
        };
        let handle = self.control.create_sip_participant(&sip_request).await?;

        let initiated_at = Utc::now();
        self.active.insert(
            session_id.clone(),
            ActiveCall {
                session_id: session_id.clone(),
                organization_id: request.organization_id.clone(),
                agent_id: request.agent_id.clone(),
                room_name: room.clone(),
                call_type: CallType::Outbound,
                state: CallState::Ringing,
                latency: latency.clone(),
                started_at: initiated_at,
                sip_participant_id: Some(handle.participant_id.clone()),
            },
        );

        // Hold the in-flight SIP timing until answer; the watchdog below
        // fails the call if ringing outlasts the timeout.
        self.spawn_ring_watchdog(session_id.clone(), ring_timeout, sip_handle);
        self.spawn_duration_cap(session_id.clone());

        self.broker.publish(PlatformEvent::CallStarted {
            session_id: session_id.clone(),
            agent_id: Some(request.agent_id.clone()),
            call_type: CallType::Outbound.as_str().to_string(),
        });
        metrics::counter!("callbridge_calls_started", "call_type" => "outbound").increment(1);

        tracing::info!(
            session_id = %session_id,
            room = %room,
            phone = %phone_number,
            "Outbound call placed"
        );

        Ok(OutboundCallResult {
            call_id: session_id,
            room_name: room,
            sip_participant_id: handle.participant_id,
            state: CallState::Ringing,
            initiated_at,
        })
    }

    /// SIP leg answered.
    pub fn on_call_answered(&self, session_id: &str) -> Result<(), TelephonyError> {
        let mut call = self
            .active
            .get_mut(session_id)
            .ok_or_else(|| TelephonyError::NotFound(session_id.to_string()))?;
        if call.state == CallState::Ringing {
            call.state = CallState::Connected;
            self.broker.publish(PlatformEvent::CallAnswered {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Call finished (either side hung up or the session closed).
    pub async fn on_call_ended(&self, session_id: &str) -> Result<(), TelephonyError> {
        let Some((_, mut call)) = self.active.remove(session_id) else {
            return Err(TelephonyError::NotFound(session_id.to_string()));
        };
        call.state = CallState::Disconnected;
        let duration_seconds = (Utc::now() - call.started_at).num_seconds();

        if let Some(participant_id) = &call.sip_participant_id {
            if let Err(e) = self
                .control
                .remove_participant(&call.room_name, participant_id)
                .await
            {
                tracing::debug!(error = %e, "Participant removal failed (may be gone)");
            }
        }
        if let Err(e) = self.control.delete_room(&call.room_name).await {
            tracing::debug!(error = %e, "Room deletion failed (may be gone)");
        }

        self.broker.publish(PlatformEvent::CallEnded {
            session_id: session_id.to_string(),
            duration_seconds,
        });
        metrics::counter!("callbridge_calls_ended").increment(1);
        metrics::histogram!("callbridge_call_duration_seconds")
            .record(duration_seconds as f64);
        Ok(())
    }

    /// Mark a call failed and drop it.
    pub fn on_call_failed(&self, session_id: &str, error: &str) {
        if let Some((_, mut call)) = self.active.remove(session_id) {
            call.state = CallState::Failed;
            self.broker.publish(PlatformEvent::CallError {
                session_id: session_id.to_string(),
                error: error.to_string(),
            });
            metrics::counter!("callbridge_calls_failed").increment(1);
        }
    }

    pub fn active_call(&self, session_id: &str) -> Option<ActiveCallView> {
        self.active.get(session_id).map(|call| ActiveCallView {
            session_id: call.session_id.clone(),
            organization_id: call.organization_id.clone(),
            agent_id: call.agent_id.clone(),
            room_name: call.room_name.clone(),
            call_type: call.call_type,
            state: call.state,
            started_at: call.started_at,
            sip_participant_id: call.sip_participant_id.clone(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Look up an active call by its room.
    pub fn find_by_room(&self, room_name: &str) -> Option<ActiveCallView> {
        self.active
            .iter()
            .find(|call| call.room_name == room_name)
            .map(|call| ActiveCallView {
                session_id: call.session_id.clone(),
                organization_id: call.organization_id.clone(),
                agent_id: call.agent_id.clone(),
                room_name: call.room_name.clone(),
                call_type: call.call_type,
                state: call.state,
                started_at: call.started_at,
                sip_participant_id: call.sip_participant_id.clone(),
            })
    }

    pub fn latency_tracker(&self, session_id: &str) -> Option<Arc<LatencyTracker>> {
        self.active.get(session_id).map(|call| call.latency.clone())
    }

    /// Forward latency breaches onto the platform broker.
    fn watch_latency(&self, session_id: &str, latency: &Arc<LatencyTracker>) {
        let mut events = latency.subscribe();
        let broker = self.broker.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let LatencyEvent::TargetExceeded {
                    operation,
                    duration,
                    target,
                } = event;
                broker.publish(PlatformEvent::LatencyExceeded {
                    session_id: session_id.clone(),
                    operation: operation.as_str().to_string(),
                    duration_ms: duration.as_millis() as u64,
                    target_ms: target.as_millis() as u64,
                });
            }
        });
    }

    /// Fail the call if it is still ringing when the timeout lapses;
    /// record the SIP connect timing when it answers first.
    fn spawn_ring_watchdog(
        &self,
        session_id: String,
        ring_timeout: Duration,
        sip_handle: callbridge_core::LatencyHandle,
    ) {
        let orchestrator = self.arc();
        tokio::spawn(async move {
            let poll = Duration::from_millis(250);
            let deadline = tokio::time::Instant::now() + ring_timeout;
            loop {
                tokio::time::sleep(poll).await;
                let state = orchestrator
                    .active
                    .get(&session_id)
                    .map(|call| call.state);
                match state {
                    Some(CallState::Ringing) => {
                        if tokio::time::Instant::now() >= deadline {
                            tracing::warn!(session_id = %session_id, "Ring timeout");
                            orchestrator.on_call_failed(&session_id, "ring timeout");
                            return;
                        }
                    }
                    Some(CallState::Connected) => {
                        if let Some(latency) = orchestrator.latency_tracker(&session_id) {
                            latency.end(sip_handle);
                        }
                        return;
                    }
                    _ => return,
                }
            }
        });
    }

    /// Hard cap on call lifetime.
    fn spawn_duration_cap(&self, session_id: String) {
        let orchestrator = self.arc();
        let cap = self.config.max_call_duration;
        tokio::spawn(async move {
            tokio::time::sleep(cap).await;
            if orchestrator.active.contains_key(&session_id) {
                tracing::warn!(session_id = %session_id, "Call duration cap reached");
                let _ = orchestrator.on_call_ended(&session_id).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::ScriptedControlPlane;
    use std::collections::HashMap;

    fn orchestrator(
        max_calls: usize,
        fail_create: bool,
    ) -> (Arc<CallOrchestrator>, Arc<EventBroker>) {
        let broker = Arc::new(EventBroker::new(64));
        let orchestrator = CallOrchestrator::new(
            Arc::new(ScriptedControlPlane {
                fail_create,
                ..Default::default()
            }),
            broker.clone(),
            OrchestratorConfig {
                max_concurrent_calls: max_calls,
                ring_timeout: Duration::from_millis(400),
                max_call_duration: Duration::from_secs(3600),
                sip_trunk_id: "trunk-1".to_string(),
                latency_targets: LatencyTargets::default(),
            },
        );
        (orchestrator, broker)
    }

    fn outbound_request(phone: &str) -> OutboundCallRequest {
        OutboundCallRequest {
            organization_id: "org1".to_string(),
            agent_id: "a1".to_string(),
            phone_number: phone.to_string(),
            room_name: None,
            ring_timeout: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn outbound_happy_path() {
        let (orchestrator, broker) = orchestrator(10, false);
        let mut events = broker.subscribe("test");

        let result = orchestrator
            .place_outbound_call(outbound_request("+919876543210"))
            .await
            .unwrap();
        assert_eq!(result.state, CallState::Ringing);
        assert!(result.room_name.starts_with("sip_org1_a1_"));
        assert_eq!(orchestrator.active_count(), 1);

        assert!(matches!(
            events.recv().await,
            Some(PlatformEvent::CallStarted { .. })
        ));

        orchestrator.on_call_answered(&result.call_id).unwrap();
        assert_eq!(
            orchestrator.active_call(&result.call_id).unwrap().state,
            CallState::Connected
        );
        assert!(matches!(
            events.recv().await,
            Some(PlatformEvent::CallAnswered { .. })
        ));

        orchestrator.on_call_ended(&result.call_id).await.unwrap();
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn invalid_phone_number_is_rejected() {
        let (orchestrator, _broker) = orchestrator(10, false);
        let result = orchestrator
            .place_outbound_call(outbound_request("0123"))
            .await;
        assert!(matches!(result, Err(TelephonyError::Validation(_))));
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn admission_cap_applies() {
        let (orchestrator, _broker) = orchestrator(1, false);
        orchestrator
            .place_outbound_call(outbound_request("+919876543210"))
            .await
            .unwrap();
        let second = orchestrator
            .place_outbound_call(outbound_request("+919876543211"))
            .await;
        assert!(matches!(second, Err(TelephonyError::Admission(_))));
    }

    #[tokio::test]
    async fn shutdown_gate_blocks_new_calls() {
        let (orchestrator, _broker) = orchestrator(10, false);
        orchestrator.stop_accepting();
        let result = orchestrator
            .place_outbound_call(outbound_request("+919876543210"))
            .await;
        assert!(matches!(result, Err(TelephonyError::Admission(_))));
    }

    #[tokio::test]
    async fn ring_timeout_fails_the_call() {
        let (orchestrator, broker) = orchestrator(10, false);
        let mut events = broker.subscribe("test");

        let result = orchestrator
            .place_outbound_call(outbound_request("+919876543210"))
            .await
            .unwrap();

        // Never answered: watchdog fires after the 400ms test timeout.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(orchestrator.active_count(), 0);

        // call:started then call:error.
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PlatformEvent::CallError { ref session_id, .. } if *session_id == result.call_id)
            {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn control_plane_failure_propagates() {
        let (orchestrator, _broker) = orchestrator(10, true);
        let result = orchestrator
            .place_outbound_call(outbound_request("+919876543210"))
            .await;
        assert!(matches!(result, Err(TelephonyError::ControlPlane(_))));
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn inbound_participant_registers_active_call() {
        let (orchestrator, _broker) = orchestrator(10, false);
        let mut attributes = HashMap::new();
        attributes.insert("sip.from".to_string(), "+14155551212".to_string());
        attributes.insert("sip.to".to_string(), "+12025550000".to_string());
        let participant = ParticipantInfo {
            identity: "sip_inbound_1".to_string(),
            kind: "sip".to_string(),
            attributes,
            metadata: None,
        };

        let (session_id, classification, _latency) = orchestrator
            .handle_participant_joined("sip_org1_a1_abc123", &participant)
            .unwrap();
        assert_eq!(classification.call_type, CallType::Inbound);
        assert!(classification.is_telephony);

        let view = orchestrator.active_call(&session_id).unwrap();
        assert_eq!(view.organization_id, "org1");
        assert_eq!(view.agent_id, "a1");
        assert_eq!(view.state, CallState::Connected);
    }
}
