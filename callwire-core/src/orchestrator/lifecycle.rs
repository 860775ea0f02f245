//! Connection lifecycle, timers and expiry

use super::CallOrchestrator;
use crate::calls::{ActiveCall, EndOptions};
use crate::error::{SignalResult, StoreResult};
use crate::events::ServerEvent;
use crate::metrics::{record_counter, CALLS_CANCELLED, CALLS_EXPIRED, CALLS_NO_ANSWER};
use crate::requests::CallRequest;
use crate::store::SignalStore;
use crate::timers::TimerKey;
use crate::types::{CallId, CallPair, CallRole, UserId};
use tracing::{debug, error, info};

const REASON_PEER_DISCONNECTED: &str = "Peer disconnected";
const REASON_BOTH_DISCONNECTED: &str = "Both users disconnected";

/// Work done by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub expired_calls: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_requests == 0 && self.expired_calls == 0
    }
}

impl<S: SignalStore + 'static> CallOrchestrator<S> {
    /// A connection for `user` was registered
    pub async fn connect(&self, user: &UserId) -> SignalResult<()> {
        let _session = self.lock_session(user).await;
        self.timers().disarm(&TimerKey::Cleanup(user.clone()));
        self.presence().mark_online(user).await?;

        if let Some(request) = self.requests().pending_incoming(user).await? {
            debug!(user_id = %user, caller_id = %request.caller_id, "Re-sending pending call");
            self.emit(
                user,
                ServerEvent::Incoming { caller_id: request.caller_id, offer: request.offer },
            );
        }

        let Some(call) = self.calls().current_call(user).await? else {
            return Ok(());
        };
        let Some(peer) = call.peer_of(user).cloned() else {
            return Ok(());
        };

        self.timers().disarm(&TimerKey::Grace(call.call_id.clone(), user.clone()));
        if self.presence().is_reachable(&peer).await? {
            self.calls().remove_expiry(&call.call_id).await?;
        }
        self.presence().mark_in_call(user).await?;

        info!(user_id = %user, call_id = %call.call_id, "User rejoined call");
        self.emit(&peer, ServerEvent::PeerOnline { user_id: user.clone(), call_id: call.call_id.clone() });
        self.emit(
            user,
            ServerEvent::Reconnect {
                is_callee: call.role_of(user) == Some(CallRole::Callee),
                call_id: call.call_id,
                caller_id: call.caller_id,
                callee_id: call.callee_id,
                offer: call.offer,
                answer: call.answer,
            },
        );
        Ok(())
    }

    /// The user's current connection closed.
    ///
    /// Ignored if the user has connected again in the meantime.
    pub async fn disconnect(&self, user: &UserId) -> SignalResult<()> {
        let _session = self.lock_session(user).await;
        if self.inner.sink.has_connection(user) {
            debug!(user_id = %user, "User reconnected, disconnect ignored");
            return Ok(());
        }

        let call = self.calls().current_call(user).await?;
        self.presence().mark_offline(user).await?;

        if let Some(call) = call {
            if let Some(peer) = call.peer_of(user) {
                self.emit(
                    peer,
                    ServerEvent::PeerOffline { user_id: user.clone(), call_id: call.call_id.clone() },
                );
            }
            self.calls().set_expiry(&call.call_id).await?;
            self.arm_grace_timer(call.call_id, user.clone());
        }

        let cleanup_user = user.clone();
        self.arm(
            TimerKey::Cleanup(user.clone()),
            self.settings().cleanup_grace,
            move |this| async move {
                if let Err(e) = this.cleanup_elapsed(&cleanup_user).await {
                    error!(user_id = %cleanup_user, error = %e, "Disconnect cleanup failed");
                }
            },
        );
        Ok(())
    }

    /// Drain everything whose TTL elapsed and finish it like its timer would
    pub async fn sweep(&self) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();

        for request in self.requests().drain_expired().await? {
            self.timers().disarm(&TimerKey::Request(request.pair()));
            self.surface_no_answer(&request);
            report.expired_requests += 1;
        }

        for call in self.calls().drain_expired().await? {
            let mut gone = None;
            for participant in [&call.caller_id, &call.callee_id] {
                if !self.presence().is_reachable(participant).await? {
                    gone = Some(participant.clone());
                    break;
                }
            }
            let reason = self.expiry_reason(&call, gone.as_ref()).await?;
            let opts =
                EndOptions { persist: true, ended_by: gone.clone(), reason: Some(reason.into()) };
            let ended = self.calls().finish(call, opts).await;
            self.after_expiry(&ended.call, gone, reason).await?;
            report.expired_calls += 1;
        }

        if !report.is_empty() {
            debug!(?report, "Expired signaling state swept");
        }
        Ok(report)
    }

    pub(super) fn arm_request_timer(&self, pair: CallPair) {
        let fired = pair.clone();
        self.arm(TimerKey::Request(pair), self.settings().request_ttl, move |this| async move {
            if let Err(e) = this.request_timed_out(&fired).await {
                error!(pair = %fired, error = %e, "Request timeout handling failed");
            }
        });
    }

    fn arm_grace_timer(&self, call_id: CallId, user: UserId) {
        let key = TimerKey::Grace(call_id.clone(), user.clone());
        self.arm(key, self.settings().disconnect_grace, move |this| async move {
            if let Err(e) = this.grace_elapsed(&call_id, &user).await {
                error!(call_id = %call_id, user_id = %user, error = %e, "Grace timeout handling failed");
            }
        });
    }

    pub(super) fn disarm_grace_timers(&self, call: &ActiveCall) {
        for participant in [&call.caller_id, &call.callee_id] {
            self.timers().disarm(&TimerKey::Grace(call.call_id.clone(), participant.clone()));
        }
    }

    async fn request_timed_out(&self, pair: &CallPair) -> StoreResult<()> {
        if let Some(request) = self.requests().take(pair).await? {
            self.surface_no_answer(&request);
        }
        Ok(())
    }

    fn surface_no_answer(&self, request: &CallRequest) {
        record_counter(CALLS_NO_ANSWER, 1);
        info!(caller_id = %request.caller_id, callee_id = %request.callee_id, "Call request unanswered");

        self.emit(&request.caller_id, ServerEvent::NoAnswer { callee_id: request.callee_id.clone() });
        self.emit(
            &request.callee_id,
            ServerEvent::Cancelled { cancelled_by: request.caller_id.clone(), call_id: None },
        );
    }

    async fn grace_elapsed(&self, call_id: &CallId, user: &UserId) -> StoreResult<()> {
        if self.presence().is_reachable(user).await? {
            debug!(call_id = %call_id, user_id = %user, "User is back, grace timer ignored");
            return Ok(());
        }
        let Some(call) = self.calls().get(call_id).await? else {
            // Gone, or already past its TTL; the sweep finishes the latter
            self.sweep().await?;
            return Ok(());
        };

        let reason = self.expiry_reason(&call, Some(user)).await?;
        let opts = EndOptions::persisted(user).with_reason(reason);
        if let Some(ended) = self.calls().end(call_id, opts).await? {
            self.after_expiry(&ended.call, Some(user.clone()), reason).await?;
        }
        Ok(())
    }

    async fn expiry_reason(&self, call: &ActiveCall, gone: Option<&UserId>) -> StoreResult<&'static str> {
        let survivor = gone.and_then(|user| call.peer_of(user));
        match survivor {
            Some(peer) if self.presence().is_reachable(peer).await? => Ok(REASON_PEER_DISCONNECTED),
            _ => Ok(REASON_BOTH_DISCONNECTED),
        }
    }

    /// Teardown shared by grace timers and the sweep. The survivor, if any,
    /// moves back to online; an offline participant stays offline.
    async fn after_expiry(
        &self,
        call: &ActiveCall,
        ended_by: Option<UserId>,
        reason: &'static str,
    ) -> StoreResult<()> {
        self.disarm_grace_timers(call);
        self.presence().mark_out_of_call(&call.caller_id).await?;
        self.presence().mark_out_of_call(&call.callee_id).await?;
        record_counter(CALLS_EXPIRED, 1);

        let notice = ServerEvent::Ended {
            call_id: call.call_id.clone(),
            ended_by,
            reason: Some(reason.to_string()),
        };
        self.emit(&call.caller_id, notice.clone());
        self.emit(&call.callee_id, notice);
        Ok(())
    }

    async fn cleanup_elapsed(&self, user: &UserId) -> StoreResult<()> {
        if self.presence().is_reachable(user).await? {
            return Ok(());
        }

        for request in self.requests().all_outgoing(user).await? {
            let pair = request.pair();
            self.timers().disarm(&TimerKey::Request(pair.clone()));
            if self.requests().take(&pair).await?.is_some() {
                record_counter(CALLS_CANCELLED, 1);
                info!(caller_id = %pair.caller, callee_id = %pair.callee, "Request of disconnected caller cancelled");
                self.emit(&pair.callee, ServerEvent::Cancelled { cancelled_by: user.clone(), call_id: None });
            }
        }
        Ok(())
    }
}
