//! Handlers for events sent by clients

use super::CallOrchestrator;
use crate::calls::EndOptions;
use crate::error::{ErrorCategory, SignalError, SignalResult};
use crate::events::{ClientEvent, ServerEvent};
use crate::metrics::{
    record_counter, CALLS_ACCEPTED, CALLS_CANCELLED, CALLS_ENDED, CALLS_INITIATED,
    CALLS_REJECTED, SIGNAL_ERRORS,
};
use crate::requests::CallRequest;
use crate::store::SignalStore;
use crate::timers::TimerKey;
use crate::types::{is_session_description, CallPair, Payload, UserId};
use tracing::{debug, error, info, warn};

const DEFAULT_REJECT_REASON: &str = "User declined";
const CALLER_SETUP_FAILED: &str = "Call setup failed. Invalid response from callee.";

impl<S: SignalStore + 'static> CallOrchestrator<S> {
    /// Handle one event from `user`.
    ///
    /// A failed handler answers the sender with `call:error` before the
    /// error is returned.
    pub async fn dispatch(&self, user: &UserId, event: ClientEvent) -> SignalResult<()> {
        let name = event.name();
        debug!(user_id = %user, event = name, "Handling client event");

        let result = match event {
            ClientEvent::Initiate { callee_id, offer } => {
                self.initiate(user, &callee_id, offer).await
            }
            ClientEvent::Response { caller_id, accepted, answer, reason } => {
                self.respond(user, &caller_id, accepted, answer, reason).await
            }
            ClientEvent::Ringing { caller_id } => self.ringing(user, &caller_id).await,
            ClientEvent::Cancel {} => self.cancel(user).await,
            ClientEvent::End {} => self.end(user).await,
            ClientEvent::Connected {} => self.connected(user).await,
            ClientEvent::IceCandidate { candidate } => self.relay_ice(user, candidate).await,
        };

        if let Err(err) = &result {
            record_counter(SIGNAL_ERRORS, 1);
            match err.category() {
                ErrorCategory::Persistence => {
                    error!(user_id = %user, event = name, error = ?err, "Signaling event failed")
                }
                _ => debug!(user_id = %user, event = name, error = %err, "Signaling event rejected"),
            }
            self.emit(user, err.to_event());
        }
        result
    }

    /// `call:initiate`: invite `callee` with an SDP offer
    pub async fn initiate(&self, caller: &UserId, callee: &UserId, offer: Payload) -> SignalResult<()> {
        if callee.is_blank() {
            return Err(SignalError::Validation("Invalid call request. Missing calleeId.".into()));
        }
        if !is_session_description(&offer) {
            return Err(SignalError::Validation(
                "Invalid call request. Invalid or missing SDP offer.".into(),
            ));
        }
        if caller == callee {
            return Err(SignalError::SelfCall);
        }

        let presence = self.presence();
        if !presence.are_friends(caller, callee).await? {
            return Err(SignalError::NotFriends);
        }

        let caller_in_call = presence.is_in_call(caller).await?;
        if !caller_in_call && !presence.is_online(caller).await? {
            return Err(SignalError::CallerOffline);
        }
        let current = self.calls().current_call(caller).await?;
        if caller_in_call || current.is_some() {
            return Err(SignalError::CallerInCall { call_id: current.map(|call| call.call_id) });
        }

        let outgoing = self.requests().all_outgoing(caller).await?;
        if outgoing.iter().any(|request| &request.callee_id != callee) {
            return Err(SignalError::PendingOutgoing);
        }

        if !presence.is_reachable(callee).await? {
            return Err(SignalError::CalleeOffline);
        }
        if presence.is_in_call(callee).await? || self.calls().current_call(callee).await?.is_some() {
            return Err(SignalError::CalleeBusy);
        }

        let request = self.requests().create(caller, callee, offer).await?;
        self.arm_request_timer(request.pair());
        record_counter(CALLS_INITIATED, 1);

        info!(caller_id = %caller, callee_id = %callee, "Call initiated");
        self.emit(callee, ServerEvent::Incoming { caller_id: caller.clone(), offer: request.offer });
        Ok(())
    }

    /// `call:ringing`: the callee's client is alerting
    pub async fn ringing(&self, callee: &UserId, caller: &UserId) -> SignalResult<()> {
        let pair = CallPair::new(caller.clone(), callee.clone());
        if caller.is_blank() || self.requests().get(&pair).await?.is_none() {
            debug!(caller_id = %caller, callee_id = %callee, "Ringing without a pending request");
            return Ok(());
        }

        self.emit(caller, ServerEvent::Ringing { callee_id: callee.clone() });
        Ok(())
    }

    /// `call:response`: the callee accepts or rejects a pending request
    pub async fn respond(
        &self,
        callee: &UserId,
        caller: &UserId,
        accepted: bool,
        answer: Option<Payload>,
        reason: Option<String>,
    ) -> SignalResult<()> {
        if caller.is_blank() {
            return Err(SignalError::Validation("Invalid call response. Missing callerId.".into()));
        }
        if caller == callee {
            return Err(SignalError::Validation("Cannot respond to your own call.".into()));
        }

        let pair = CallPair::new(caller.clone(), callee.clone());
        if self.requests().get(&pair).await?.is_none() {
            return Err(SignalError::RequestExpired);
        }

        self.timers().disarm(&TimerKey::Request(pair.clone()));
        let Some(request) = self.requests().take(&pair).await? else {
            debug!(pair = %pair, "Request consumed by a concurrent handler");
            return Ok(());
        };

        let result = if accepted {
            self.accept(request, answer).await
        } else {
            self.reject(&request, reason);
            Ok(())
        };

        if let Err(err) = &result {
            let notice = match err {
                SignalError::Validation(_) => ServerEvent::error(CALLER_SETUP_FAILED),
                other => other.to_event(),
            };
            self.emit(caller, notice);
        }
        result
    }

    async fn accept(&self, request: CallRequest, answer: Option<Payload>) -> SignalResult<()> {
        let answer = answer.filter(is_session_description).ok_or_else(|| {
            SignalError::Validation("Invalid call response. Missing WebRTC answer.".into())
        })?;

        let CallRequest { caller_id, callee_id, offer, .. } = request;

        // Held until both are in the call, so the caller's disconnect either
        // sees the call or has already happened
        let _caller_session = self.lock_session(&caller_id).await;
        if !self.presence().is_reachable(&caller_id).await? {
            info!(caller_id = %caller_id, callee_id = %callee_id, "Caller left before the answer");
            return Err(SignalError::CallerGone);
        }

        let call = self
            .calls()
            .create(&caller_id, &callee_id, offer, answer)
            .await
            .map_err(SignalError::SetupFailed)?;

        self.presence().mark_in_call(&caller_id).await?;
        self.presence().mark_in_call(&callee_id).await?;
        record_counter(CALLS_ACCEPTED, 1);

        self.emit(
            &caller_id,
            ServerEvent::Accepted {
                callee_id: callee_id.clone(),
                answer: call.answer,
                call_id: call.call_id,
            },
        );
        Ok(())
    }

    fn reject(&self, request: &CallRequest, reason: Option<String>) {
        let reason = reason
            .filter(|reason| !reason.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string());
        record_counter(CALLS_REJECTED, 1);

        info!(caller_id = %request.caller_id, callee_id = %request.callee_id, reason = %reason, "Call rejected");
        self.emit(
            &request.caller_id,
            ServerEvent::Rejected { callee_id: request.callee_id.clone(), reason },
        );
    }

    /// `call:cancel`: withdraw a pending request or an unconnected call
    pub async fn cancel(&self, user: &UserId) -> SignalResult<()> {
        if let Some(request) = self.requests().pending_outgoing(user).await? {
            let pair = request.pair();
            self.timers().disarm(&TimerKey::Request(pair.clone()));

            if self.requests().take(&pair).await?.is_some() {
                self.presence().mark_out_of_call(&pair.caller).await?;
                self.presence().mark_out_of_call(&pair.callee).await?;
                record_counter(CALLS_CANCELLED, 1);

                info!(caller_id = %pair.caller, callee_id = %pair.callee, "Call request cancelled");
                let notice = ServerEvent::Cancelled { cancelled_by: user.clone(), call_id: None };
                self.emit(&pair.callee, notice.clone());
                self.emit(user, notice);
                return Ok(());
            }
        }

        let Some(call) = self.calls().current_call(user).await? else {
            return Err(SignalError::NoActiveCall("No active call or call request to cancel."));
        };
        if &call.caller_id != user {
            return Err(SignalError::NotCaller);
        }
        if call.is_connected() {
            return Err(SignalError::AlreadyConnected);
        }

        let opts = EndOptions::unpersisted(user).with_reason("cancelled");
        let Some(ended) = self.calls().end(&call.call_id, opts).await? else {
            debug!(call_id = %call.call_id, "Call already ended");
            return Ok(());
        };

        self.disarm_grace_timers(&ended.call);
        self.presence().mark_out_of_call(&ended.call.caller_id).await?;
        self.presence().mark_out_of_call(&ended.call.callee_id).await?;
        record_counter(CALLS_CANCELLED, 1);

        let notice = ServerEvent::Cancelled {
            cancelled_by: user.clone(),
            call_id: Some(ended.call.call_id.clone()),
        };
        self.emit(&ended.call.callee_id, notice.clone());
        self.emit(user, notice);
        Ok(())
    }

    /// `call:end`: hang up the current call
    pub async fn end(&self, user: &UserId) -> SignalResult<()> {
        let Some(call) = self.calls().current_call(user).await? else {
            return Err(SignalError::NoActiveCall("No active call to end."));
        };

        let opts = EndOptions::persisted(user).with_reason("user-ended");
        let Some(ended) = self.calls().end(&call.call_id, opts).await? else {
            debug!(call_id = %call.call_id, "Call already ended");
            return Ok(());
        };

        self.disarm_grace_timers(&ended.call);
        self.presence().mark_out_of_call(&ended.call.caller_id).await?;
        self.presence().mark_out_of_call(&ended.call.callee_id).await?;
        record_counter(CALLS_ENDED, 1);

        let notice = ServerEvent::Ended {
            call_id: ended.call.call_id.clone(),
            ended_by: Some(user.clone()),
            reason: None,
        };
        if let Some(peer) = ended.call.peer_of(user) {
            self.emit(peer, notice.clone());
        }
        self.emit(user, notice);
        Ok(())
    }

    /// `call:connected`: media is flowing
    pub async fn connected(&self, user: &UserId) -> SignalResult<()> {
        match self.calls().current_call(user).await? {
            Some(call) => {
                self.calls().mark_connected(&call.call_id).await?;
            }
            None => debug!(user_id = %user, "Connected acknowledgement without a call"),
        }
        Ok(())
    }

    /// `ice:candidate`: relay to the other participant
    pub async fn relay_ice(&self, user: &UserId, candidate: Payload) -> SignalResult<()> {
        let Some(call) = self.calls().current_call(user).await? else {
            debug!(user_id = %user, "Dropping ICE candidate without a call");
            return Ok(());
        };

        match call.peer_of(user) {
            Some(peer) => self.emit(peer, ServerEvent::IceCandidate { candidate }),
            None => warn!(user_id = %user, call_id = %call.call_id, "Pointer names a call without the user"),
        }
        Ok(())
    }
}
