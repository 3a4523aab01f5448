use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use crate::modem::types::{CallerId, HangupCause, InterfaceState, PhoneCallflow, SessionError};

/// How long a call may sit in `Incoming` without a RING before the phonebook is polled.
pub const INCOMING_POLL_AFTER: Duration = Duration::from_secs(3);

/// How long after the last RING an unanswered call is considered dead.
pub const RING_TIMEOUT: Duration = Duration::from_secs(10);

/// Call related input derived from an unsolicited line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    Ring,

    /// `+CLIP`, caller identification sent alongside RING.
    CallerId(CallerId),

    /// `+CLCC`, the current call list.
    CallList(CallerId),

    /// Last received-calls phonebook entry, for phones that never send RING.
    Phonebook(CallerId),

    Progress(PhoneCallflow)
}

/// Something the session has to do as a consequence of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAction {
    NotifyRinging(CallerId),
    NotifyAnswered,
    NotifyHungup(HangupCause),
    RequestCallList,
    PollPhonebook,
    ForceHangup(HangupCause)
}

#[derive(Debug, Default)]
pub struct CallStateMachine {
    interface: InterfaceState,
    callflow: PhoneCallflow,
    caller_id: CallerId,
    incoming_since: Option<Instant>,
    last_ring: Option<Instant>
}
impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interface(&self) -> InterfaceState {
        self.interface
    }

    pub fn callflow(&self) -> PhoneCallflow {
        self.callflow
    }

    pub fn caller_id(&self) -> &CallerId {
        &self.caller_id
    }

    pub fn is_down(&self) -> bool {
        matches!(self.interface, InterfaceState::Down | InterfaceState::Idle)
    }

    /// Whether an incoming call can still be (re)announced on this interface.
    fn accepts_incoming(&self) -> bool {
        self.is_down() || self.interface == InterfaceState::Ring
    }

    pub fn apply(&mut self, signal: CallSignal) -> Vec<CallAction> {
        match signal {
            CallSignal::Ring => self.on_ring(),
            CallSignal::CallerId(caller) => self.on_identified_ring(caller, "CLIP"),
            CallSignal::Phonebook(caller) => self.on_identified_ring(caller, "phonebook"),
            CallSignal::CallList(caller) => {
                if !self.accepts_incoming() {
                    debug!("Ignoring call list entry for {} while {:?}", caller.number, self.interface);
                    return Vec::new();
                }
                debug!("CLCC caller id: name is {}, number is {}", caller.name, caller.number);
                self.caller_id = caller;
                self.callflow = PhoneCallflow::IncomingRing;
                self.last_ring.get_or_insert_with(Instant::now);
                Vec::new()
            },
            CallSignal::Progress(callflow) => self.on_progress(callflow)
        }
    }

    fn on_ring(&mut self) -> Vec<CallAction> {
        if !self.accepts_incoming() {
            warn!("Got RING while interface is {:?}, ignoring", self.interface);
            return Vec::new();
        }

        self.last_ring = Some(Instant::now());
        if self.callflow == PhoneCallflow::IncomingRing {
            if self.interface == InterfaceState::Ring {
                return Vec::new();
            }

            debug!("Got second RING, interface is now ringing");
            self.interface = InterfaceState::Ring;
            return vec![CallAction::NotifyRinging(self.caller_id.clone())];
        }

        // First RING: no caller id yet for this call.
        debug!("Got first RING");
        self.caller_id.clear();
        self.callflow = PhoneCallflow::IncomingRing;
        self.incoming_since = None;
        vec![CallAction::RequestCallList]
    }

    fn on_identified_ring(&mut self, caller: CallerId, source: &str) -> Vec<CallAction> {
        if !self.accepts_incoming() {
            debug!("Ignoring {} caller id {} while {:?}", source, caller.number, self.interface);
            return Vec::new();
        }

        info!("Incoming call from {} ({}) via {}", caller.number, caller.name, source);
        self.caller_id = caller;
        self.callflow = PhoneCallflow::IncomingRing;
        self.incoming_since = None;
        self.last_ring = Some(Instant::now());

        if self.interface == InterfaceState::Ring {
            return Vec::new();
        }
        self.interface = InterfaceState::Ring;
        vec![CallAction::NotifyRinging(self.caller_id.clone())]
    }

    fn on_progress(&mut self, callflow: PhoneCallflow) -> Vec<CallAction> {
        debug!("Call progress {:?} -> {:?} (interface {:?})", self.callflow, callflow, self.interface);
        match callflow {
            PhoneCallflow::Idle => {
                self.callflow = PhoneCallflow::Idle;
                self.end_call(HangupCause::Normal)
            },
            PhoneCallflow::NoCarrier => {
                self.callflow = callflow;
                self.end_call(HangupCause::Normal)
            },
            PhoneCallflow::LineBusy => {
                self.callflow = callflow;
                self.end_call(HangupCause::Busy)
            },
            PhoneCallflow::NoAnswer => {
                self.callflow = callflow;
                self.end_call(HangupCause::NoAnswer)
            },
            PhoneCallflow::Failed
            | PhoneCallflow::NoService
            | PhoneCallflow::OutgoingRestricted
            | PhoneCallflow::SecurityFail => {
                self.callflow = callflow;
                self.end_call(HangupCause::Failure)
            },
            PhoneCallflow::Incoming => {
                if !matches!(self.callflow, PhoneCallflow::Incoming | PhoneCallflow::IncomingRing) {
                    self.caller_id.clear();
                    self.callflow = PhoneCallflow::Incoming;
                    self.incoming_since = Some(Instant::now());
                }
                Vec::new()
            },
            PhoneCallflow::Active => {
                self.callflow = PhoneCallflow::Active;
                self.incoming_since = None;
                self.last_ring = None;
                if self.interface == InterfaceState::Up {
                    return Vec::new();
                }
                info!("Call is active");
                self.interface = InterfaceState::Up;
                vec![CallAction::NotifyAnswered]
            },
            other => {
                self.callflow = other;
                Vec::new()
            }
        }
    }

    fn end_call(&mut self, cause: HangupCause) -> Vec<CallAction> {
        self.incoming_since = None;
        self.last_ring = None;
        if self.is_down() {
            debug!("Call ended ({:?}) while interface already down", cause);
            return Vec::new();
        }

        info!("Call ended: {:?}", cause);
        self.interface = InterfaceState::Down;
        vec![CallAction::NotifyHungup(cause)]
    }

    /// Watchdogs for incoming calls that never resolve.
    pub fn check_timers(&mut self, now: Instant) -> Vec<CallAction> {
        let mut actions = Vec::new();

        if self.callflow == PhoneCallflow::Incoming {
            if let Some(since) = self.incoming_since {
                if now.saturating_duration_since(since) > INCOMING_POLL_AFTER {
                    debug!("Incoming call without RING, polling received calls phonebook");
                    self.incoming_since = None;
                    actions.push(CallAction::PollPhonebook);
                }
            }
        }

        if self.callflow == PhoneCallflow::IncomingRing {
            if let Some(ring) = self.last_ring {
                if now.saturating_duration_since(ring) > RING_TIMEOUT {
                    error!("Ringing stopped and the call was not answered");
                    self.last_ring = None;
                    actions.push(CallAction::ForceHangup(HangupCause::Failure));
                }
            }
        }
        actions
    }

    pub fn begin_dial(&mut self, number: &str) -> Result<(), SessionError> {
        if !self.is_down() {
            return Err(SessionError::InvalidState {
                operation: "dial",
                state: self.interface
            });
        }

        info!("Dialing {}", number);
        self.caller_id = CallerId {
            name: String::new(),
            number: number.to_string()
        };
        self.callflow = PhoneCallflow::Dialing;
        self.interface = InterfaceState::Dialing;
        Ok(())
    }

    pub fn dial_failed(&mut self) {
        self.callflow = PhoneCallflow::Failed;
        self.interface = InterfaceState::Down;
    }

    pub fn begin_answer(&self) -> Result<(), SessionError> {
        match self.interface {
            InterfaceState::Ring => Ok(()),
            state => Err(SessionError::InvalidState { operation: "answer", state })
        }
    }

    /// Returns false when there is nothing to hang up.
    /// Returns false when no call is up. A half-announced incoming call is
    /// still forgotten so the next RING starts over.
    pub fn begin_hangup(&mut self) -> bool {
        if self.is_down() {
            self.callflow = PhoneCallflow::Idle;
            self.caller_id.clear();
            self.incoming_since = None;
            self.last_ring = None;
            return false;
        }
        self.callflow = PhoneCallflow::HangupRequested;
        self.interface = InterfaceState::HangupRequested;
        true
    }

    /// Local reset after a hangup, whatever the modem answered.
    pub fn finish_hangup(&mut self, cause: HangupCause) -> Vec<CallAction> {
        let actions = self.end_call(cause);
        self.callflow = PhoneCallflow::Idle;
        actions
    }

    /// The link is gone, so any call on it is too.
    pub fn link_lost(&mut self) -> Vec<CallAction> {
        self.callflow = PhoneCallflow::Failed;
        let actions = self.end_call(HangupCause::Failure);
        self.callflow = PhoneCallflow::Idle;
        actions
    }
}
