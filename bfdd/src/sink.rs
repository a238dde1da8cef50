//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock;
use std::time::Instant;

use bfdd_utils::UnboundedSender;
use bfdd_utils::bfd::State;
use bytes::{BufMut, Bytes, BytesMut};
use derive_new::new;
use tracing::debug;

use crate::session::Session;

// Size of the fixed name field of an event record.
pub const RECORD_NAME_LEN: usize = 32;
// Encoded size of an event record.
pub const RECORD_LEN: usize = RECORD_NAME_LEN + 1 + 8;

// Anchor for the monotonic timestamps carried by event records.
static MONOTONIC_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

// State-change record pushed to the external supervisor. The wire format is
// a NUL-padded fixed-size name, one state byte and a big-endian monotonic
// microsecond timestamp.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct EventRecord {
    pub name: String,
    pub state: State,
    pub sent_time: u64,
}

// Best-effort notification channel to the external supervisor.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: UnboundedSender<Bytes>,
}

// ===== impl EventRecord =====

impl EventRecord {
    // Encodes the event record into a bytes buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_LEN);

        let mut name = [0u8; RECORD_NAME_LEN];
        let len = self.name.len().min(RECORD_NAME_LEN - 1);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        buf.put_slice(&name);
        buf.put_u8(self.state as u8);
        buf.put_u64(self.sent_time);

        buf.freeze()
    }
}

// ===== impl EventSink =====

impl EventSink {
    pub fn new(tx: UnboundedSender<Bytes>) -> EventSink {
        EventSink { tx }
    }

    // Pushes a state-change record for the given session.
    //
    // Best effort: the session state is authoritative, so a closed channel
    // only costs the notification.
    pub(crate) fn state_change(&self, sess: &Session) {
        let record = EventRecord::new(
            sess.name().to_owned(),
            sess.state.local_state,
            monotonic_us(),
        );
        if self.tx.send(record.encode()).is_err() {
            debug!(name = %sess.name(), "supervisor channel closed, dropping event");
        }
    }
}

// ===== global functions =====

// Returns the number of microseconds elapsed since the process-wide
// monotonic epoch.
pub fn monotonic_us() -> u64 {
    MONOTONIC_EPOCH.elapsed().as_micros() as u64
}

// ===== tests =====
