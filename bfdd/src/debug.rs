//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use bfdd_utils::bfd::State;
use tracing::{debug, debug_span};

// BFD debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    SessionCreate(&'a str),
    SessionDelete(&'a str),
    SessionReset(&'a str),
    FsmTransition(&'a str, State, State),
    DetectionTimeExpiry(&'a str),
    StaleEvent(&'a str, &'a str),
    DispatcherStart,
    DispatcherSuspend,
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::SessionCreate(name)
            | Debug::SessionDelete(name)
            | Debug::SessionReset(name) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(name, old_state, new_state) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(?old_state, ?new_state, "{}", self);
                });
            }
            Debug::DetectionTimeExpiry(name) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::StaleEvent(name, event) => {
                debug_span!("session", %name).in_scope(|| {
                    debug!(%event, "{}", self);
                });
            }
            Debug::DispatcherStart | Debug::DispatcherSuspend => {
                debug!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::SessionCreate(..) => {
                write!(f, "session created")
            }
            Debug::SessionDelete(..) => {
                write!(f, "session deleted")
            }
            Debug::SessionReset(..) => {
                write!(f, "session reset to initial state")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::DetectionTimeExpiry(..) => {
                write!(f, "detection timer expired")
            }
            Debug::StaleEvent(..) => {
                write!(f, "stale event ignored")
            }
            Debug::DispatcherStart => {
                write!(f, "dispatcher started")
            }
            Debug::DispatcherSuspend => {
                write!(f, "dispatcher suspended")
            }
        }
    }
}
