//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, atomic};
use std::time::{Duration, Instant};

use bfdd_utils::Sender;
use bfdd_utils::bfd::State;
use bfdd_utils::socket::UdpSocket;
use bfdd_utils::task::{IntervalTask, TimeoutTask};
use chrono::{DateTime, Utc};
use derive_new::new;
use generational_arena::{Arena, Index};
use rand::RngCore;

use crate::config::InstanceCfg;
use crate::debug::Debug;
use crate::error::Error;
use crate::master::{InstanceChannelsTx, ProtocolInputChannelsTx};
use crate::packet::{DiagnosticCode, Packet, PacketFlags};
use crate::tasks;
use crate::tasks::messages::input::{
    DetectTimerMsg, ResetTimerMsg, TxFailureMsg,
};

pub type SessionId = usize;
pub type SessionIndex = Index;

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub config: InstanceCfg,
    pub state: SessionState,
    pub timers: SessionTimers,
    pub statistics: SessionStatistics,
}

#[derive(Debug)]
pub struct SessionState {
    pub socket_tx: Option<Arc<UdpSocket>>,
    pub sockaddr: Option<SocketAddr>,
    pub local_state: State,
    pub local_discr: u32,
    pub local_diag: DiagnosticCode,
    // Effective intervals and detection times, in microseconds. These are
    // derived from the configured and received minimums but stored, since
    // renegotiation freezes them while the session is Up.
    pub local_tx_interval: u32,
    pub remote_tx_interval: u32,
    pub local_detect_time: u64,
    pub remote_detect_time: u64,
    pub poll_active: Arc<AtomicBool>,
    pub final_pending: Arc<AtomicBool>,
    pub remote: Option<SessionRemoteInfo>,
    pub last_seen: Option<Instant>,
}

#[derive(Debug, new)]
pub struct SessionRemoteInfo {
    pub state: State,
    pub discr: u32,
    pub diag: u8,
    pub multiplier: u8,
    pub min_tx: u32,
    pub min_rx: u32,
    pub demand_mode: bool,
}

// Per-session timer handles. Dropping a handle cancels the timer; the saved
// slots hold the remaining time of a timer suspended across a reload.
#[derive(Debug, Default)]
pub struct SessionTimers {
    pub tx_interval: Option<IntervalTask>,
    pub detection: Option<TimeoutTask>,
    pub reset: Option<TimeoutTask>,
    pub saved_tx: Option<Duration>,
    pub saved_detection: Option<Duration>,
    pub saved_reset: Option<Duration>,
}

#[derive(Debug)]
pub struct SessionStatistics {
    pub create_time: DateTime<Utc>,
    pub last_state_change_time: Option<DateTime<Utc>>,
    pub last_down_time: Option<DateTime<Utc>>,
    pub last_up_time: Option<DateTime<Utc>>,
    pub down_count: u32,
    pub admin_down_count: u32,
    pub rx_packet_count: u64,
    pub tx_packet_count: Arc<AtomicU64>,
    pub rx_error_count: u64,
    pub tx_error_count: Arc<AtomicU64>,
}

#[derive(Debug, Default)]
pub struct Sessions {
    // Session arena.
    arena: Arena<Session>,
    // Session hash table keyed by ID (1:1).
    id_tree: HashMap<SessionId, SessionIndex>,
    // Session binary tree keyed by instance name (1:1).
    name_tree: BTreeMap<String, SessionIndex>,
    // Session hash table keyed by neighbor address (1:1).
    addr_tree: HashMap<IpAddr, SessionIndex>,
    // Session hash table keyed by local discriminator (1:1).
    discr_tree: HashMap<u32, SessionIndex>,
    // Next available ID.
    next_id: SessionId,
}

// ===== impl Session =====

impl Session {
    // Creates a new BFD session from its configuration.
    fn new(id: SessionId, config: InstanceCfg, local_discr: u32) -> Session {
        Debug::SessionCreate(&config.name).log();

        let local_state = if config.enabled {
            State::Down
        } else {
            State::AdminDown
        };
        let local_tx_interval = config.idle_tx;

        Session {
            id,
            config,
            state: SessionState {
                socket_tx: None,
                sockaddr: None,
                local_state,
                local_discr,
                local_diag: DiagnosticCode::Nothing,
                local_tx_interval,
                remote_tx_interval: 0,
                local_detect_time: 0,
                remote_detect_time: 0,
                poll_active: Arc::new(AtomicBool::new(false)),
                final_pending: Arc::new(AtomicBool::new(false)),
                remote: None,
                last_seen: None,
            },
            timers: Default::default(),
            statistics: Default::default(),
        }
    }

    // Returns the name identifying the session.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    // Updates the FSM state of the BFD session, running the entry actions of
    // the new state and notifying the supervisor.
    pub(crate) fn state_update(
        &mut self,
        state: State,
        diag: DiagnosticCode,
        tx: &InstanceChannelsTx,
    ) {
        let old_state = self.state.local_state;
        self.state.local_state = state;
        self.state.local_diag = diag;

        Debug::FsmTransition(self.name(), old_state, state).log();

        match state {
            State::Init | State::Up => {
                // The reset timer only makes sense while the session stays
                // down.
                self.timers.reset = None;
                self.timers.saved_reset = None;

                if state == State::Up {
                    // Leave the idle rate now that both systems agree the
                    // session is up.
                    self.update_local_tx_interval();
                    self.update_detection_times();
                }

                if self.timers.detection.is_none()
                    && self.state.local_detect_time != 0
                {
                    self.update_detection_time(&tx.protocol_input.detect_timer);
                }
            }
            State::Down | State::AdminDown => {
                // RFC 5880 section 6.8.3: sessions that are not Up must not
                // transmit faster than once per second.
                self.state.local_tx_interval = self.config.idle_tx;
                self.update_detection_times();
                self.timers.detection = None;
                self.timers.saved_detection = None;

                if state == State::Down {
                    self.update_reset_timer(&tx.protocol_input.reset_timer);
                } else {
                    // AdminDown cancels everything, including timers parked
                    // across a reload.
                    self.timers.reset = None;
                    self.timers.saved_reset = None;
                    self.timers.saved_tx = None;
                }
            }
        }

        // Notify the supervisor about the state transition.
        tx.sink.state_change(self);

        // Update statistics.
        self.statistics.last_state_change_time = Some(Utc::now());
        match state {
            State::AdminDown => {
                self.statistics.admin_down_count += 1;
            }
            State::Down => {
                self.statistics.last_down_time = Some(Utc::now());
                self.statistics.down_count += 1;
            }
            State::Up => {
                self.statistics.last_up_time = Some(Utc::now());
            }
            _ => {}
        }

        // Synchronize the Tx task since the local state has changed.
        self.update_tx_interval(&tx.protocol_input.tx_failure);
    }

    // Returns the last value of Required Min Rx Interval received from the
    // remote system in a BFD Control packet.
    //
    // If we haven't heard from our peer yet, return the initial value (1
    // microsecond).
    pub(crate) fn remote_min_rx_interval(&self) -> u32 {
        self.state
            .remote
            .as_ref()
            .map(|remote| remote.min_rx)
            .unwrap_or(1)
    }

    // Recomputes the effective transmit interval.
    pub(crate) fn update_local_tx_interval(&mut self) {
        let mut interval =
            std::cmp::max(self.config.min_tx, self.remote_min_rx_interval());

        // RFC 5880 section 6.8.3: sessions that are not Up must not transmit
        // faster than once per second.
        if self.state.local_state != State::Up {
            interval = std::cmp::max(interval, self.config.idle_tx);
        }

        self.state.local_tx_interval = interval;
    }

    // Recomputes the interval the remote system is expected to transmit at.
    pub(crate) fn update_remote_tx_interval(&mut self) {
        if let Some(remote) = &self.state.remote {
            self.state.remote_tx_interval =
                std::cmp::max(self.config.min_rx, remote.min_tx);
        }
    }

    // Recomputes the detection times on both directions of the session.
    pub(crate) fn update_detection_times(&mut self) {
        if let Some(remote) = &self.state.remote {
            self.state.local_detect_time = remote.multiplier as u64
                * self.state.remote_tx_interval as u64;
        }
        self.state.remote_detect_time = self.config.multiplier as u64
            * self.state.local_tx_interval as u64;
    }

    // Returns whether periodic transmission must be suppressed because the
    // remote system is in Demand mode and both systems are Up (RFC 5880,
    // section 6.6).
    fn demand_suppressed(&self) -> bool {
        self.state.local_state == State::Up
            && self
                .state
                .remote
                .as_ref()
                .is_some_and(|remote| {
                    remote.demand_mode && remote.state == State::Up
                })
    }

    // Returns whether the periodic Tx task is supposed to be running.
    pub fn should_transmit(&self) -> bool {
        self.state.local_state != State::AdminDown && !self.demand_suppressed()
    }

    // Generates a BFD Control packet according to the session's state and
    // configuration. The P/F flags are filled in at transmission time.
    pub(crate) fn generate_packet(&self) -> Packet {
        Packet {
            version: 1,
            diag: self.state.local_diag as u8,
            state: self.state.local_state,
            flags: PacketFlags::empty(),
            detect_mult: self.config.multiplier,
            my_discr: self.state.local_discr,
            your_discr: self
                .state
                .remote
                .as_ref()
                .map(|remote| remote.discr)
                .unwrap_or(0),
            desired_min_tx: self.config.min_tx,
            req_min_rx: self.config.min_rx,
            req_min_echo_rx: 0,
        }
    }

    // (Re)starts or stops the periodic transmission of BFD packets.
    pub(crate) fn update_tx_interval(
        &mut self,
        tx_failurep: &Sender<TxFailureMsg>,
    ) {
        if self.should_transmit()
            && let Some(socket_tx) = &self.state.socket_tx
            && let Some(sockaddr) = self.state.sockaddr
        {
            // (Re)start Tx task, sending the first packet right away.
            let task = tasks::udp_tx_interval(
                self,
                Some(Duration::ZERO),
                socket_tx,
                sockaddr,
                tx_failurep,
            );
            self.timers.tx_interval = Some(task);
        } else {
            // Stop Tx task.
            self.timers.tx_interval = None;
        }
    }

    // Sends a single BFD Control packet answering a Poll, outside the
    // periodic cadence.
    pub(crate) fn send_tx_final(
        &mut self,
        tx_failurep: &Sender<TxFailureMsg>,
    ) {
        self.state
            .final_pending
            .store(true, atomic::Ordering::Relaxed);
        if let Some(socket_tx) = &self.state.socket_tx
            && let Some(sockaddr) = self.state.sockaddr
        {
            tasks::udp_tx_final(self, socket_tx, sockaddr, tx_failurep);
        }
    }

    // (Re)sets the detection time (timeout) for this session.
    pub(crate) fn update_detection_time(
        &mut self,
        detect_timerp: &Sender<DetectTimerMsg>,
    ) {
        let holdtime = Duration::from_micros(self.state.local_detect_time);
        match &mut self.timers.detection {
            Some(timer) => timer.reset(Some(holdtime)),
            None => {
                self.timers.detection =
                    Some(tasks::detection_timer(self.id, holdtime, detect_timerp));
            }
        }
    }

    // Arms the reset timer, which returns a session stuck in Down to its
    // initial protocol state.
    pub(crate) fn update_reset_timer(
        &mut self,
        reset_timerp: &Sender<ResetTimerMsg>,
    ) {
        // A session that never saw its peer has no detection time and nothing
        // worth resetting.
        if self.state.local_detect_time != 0 {
            let holdtime = Duration::from_micros(self.state.local_detect_time);
            self.timers.reset =
                Some(tasks::reset_timer(self.id, holdtime, reset_timerp));
        }
    }

    // Initiates a Poll Sequence.
    //
    // A pending Final takes precedence: the poll is refused until the Final
    // has been transmitted.
    pub(crate) fn poll_sequence_start(&self) {
        if self.state.final_pending.load(atomic::Ordering::Relaxed) {
            return;
        }
        self.state.poll_active.store(true, atomic::Ordering::Relaxed);
    }

    // Terminates a Poll Sequence.
    pub(crate) fn poll_sequence_terminate(&self) {
        self.state
            .poll_active
            .store(false, atomic::Ordering::Relaxed);
    }

    // Checks whether a Poll Sequence is in progress.
    pub(crate) fn poll_sequence_is_active(&self) -> bool {
        self.state.poll_active.load(atomic::Ordering::Relaxed)
    }

    // Reinitializes the protocol state to its initial template, keeping the
    // configuration. The caller provides the rerolled discriminator.
    pub(crate) fn reset_state(&mut self, local_discr: u32) {
        Debug::SessionReset(self.name()).log();

        self.state.local_discr = local_discr;
        self.state.local_diag = DiagnosticCode::Nothing;
        self.state.local_tx_interval = self.config.idle_tx;
        self.state.remote_tx_interval = 0;
        self.state.local_detect_time = 0;
        self.state.remote_detect_time = 0;
        self.state.remote = None;
        self.state.last_seen = None;
        self.state
            .poll_active
            .store(false, atomic::Ordering::Relaxed);
        self.state
            .final_pending
            .store(false, atomic::Ordering::Relaxed);
        self.timers.reset = None;
    }

    // Captures the remaining time of every armed timer and cancels it, in
    // preparation for a reload.
    pub(crate) fn suspend_timers(&mut self) {
        if let Some(task) = self.timers.tx_interval.take() {
            self.timers.saved_tx = Some(task.remaining());
        }
        if let Some(task) = self.timers.detection.take() {
            self.timers.saved_detection = Some(task.remaining());
        }
        if let Some(task) = self.timers.reset.take() {
            self.timers.saved_reset = Some(task.remaining());
        }
    }

    // Re-registers the session's timers, resuming suspended ones at their
    // saved deadlines.
    pub(crate) fn resume_timers(
        &mut self,
        protocol_input: &ProtocolInputChannelsTx,
    ) {
        if let Some(delay) = self.timers.saved_tx.take()
            && self.should_transmit()
            && let Some(socket_tx) = &self.state.socket_tx
            && let Some(sockaddr) = self.state.sockaddr
        {
            let task = tasks::udp_tx_interval(
                self,
                Some(delay),
                socket_tx,
                sockaddr,
                &protocol_input.tx_failure,
            );
            self.timers.tx_interval = Some(task);
        } else {
            self.update_tx_interval(&protocol_input.tx_failure);
        }
        if let Some(delay) = self.timers.saved_detection.take() {
            self.timers.detection = Some(tasks::detection_timer(
                self.id,
                delay,
                &protocol_input.detect_timer,
            ));
        }
        if let Some(delay) = self.timers.saved_reset.take() {
            self.timers.reset = Some(tasks::reset_timer(
                self.id,
                delay,
                &protocol_input.reset_timer,
            ));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        Debug::SessionDelete(self.name()).log();
    }
}

// ===== impl SessionStatistics =====

impl Default for SessionStatistics {
    fn default() -> SessionStatistics {
        SessionStatistics {
            create_time: Utc::now(),
            last_state_change_time: None,
            last_down_time: None,
            last_up_time: None,
            down_count: 0,
            admin_down_count: 0,
            rx_packet_count: 0,
            tx_packet_count: Arc::new(AtomicU64::new(0)),
            rx_error_count: 0,
            tx_error_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

// ===== impl Sessions =====

impl Sessions {
    // Creates and inserts a new session from its configuration.
    pub(crate) fn insert(
        &mut self,
        config: InstanceCfg,
    ) -> (SessionIndex, &mut Session) {
        let id = self.next_id();
        let local_discr = self.generate_discr();
        let sess = Session::new(id, config, local_discr);
        self.link(sess)
    }

    // Inserts a session carried over from a previous configuration, keeping
    // its ID and discriminator.
    pub(crate) fn insert_existing(
        &mut self,
        sess: Session,
    ) -> (SessionIndex, &mut Session) {
        self.next_id = std::cmp::max(self.next_id, sess.id);
        self.link(sess)
    }

    // Links a session to the different collections.
    fn link(&mut self, sess: Session) -> (SessionIndex, &mut Session) {
        let sess_idx = self.arena.insert(sess);
        let sess = &self.arena[sess_idx];
        self.id_tree.insert(sess.id, sess_idx);
        self.name_tree.insert(sess.name().to_owned(), sess_idx);
        self.discr_tree.insert(sess.state.local_discr, sess_idx);
        if sess.config.enabled
            && let Some(addr) = sess.config.nbr_addr
        {
            self.addr_tree.insert(addr, sess_idx);
        }
        (sess_idx, &mut self.arena[sess_idx])
    }

    // Removes the session with the given name from all collections and
    // returns it, preserving its runtime state.
    pub(crate) fn take_by_name(&mut self, name: &str) -> Option<Session> {
        let sess_idx = self.name_tree.remove(name)?;
        let sess = self.arena.remove(sess_idx).unwrap();
        self.id_tree.remove(&sess.id);
        self.discr_tree.remove(&sess.state.local_discr);
        if let Some(addr) = sess.config.nbr_addr {
            self.addr_tree.remove(&addr);
        }
        Some(sess)
    }

    // Returns a reference to the session corresponding to the given name.
    pub fn get_by_name(&self, name: &str) -> Option<(SessionIndex, &Session)> {
        self.name_tree
            .get(name)
            .copied()
            .map(|sess_idx| (sess_idx, &self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the given
    // ID.
    pub(crate) fn get_mut_by_id(
        &mut self,
        id: SessionId,
    ) -> Result<(SessionIndex, &mut Session), Error> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
            .ok_or(Error::SessionIdNotFound(id))
    }

    // Returns a mutable reference to the session corresponding to the given
    // local discriminator.
    pub(crate) fn get_mut_by_discr(
        &mut self,
        discr: u32,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.discr_tree
            .get(&discr)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns a mutable reference to the session corresponding to the given
    // neighbor address.
    pub(crate) fn get_mut_by_addr(
        &mut self,
        addr: &IpAddr,
    ) -> Option<(SessionIndex, &mut Session)> {
        self.addr_tree
            .get(addr)
            .copied()
            .map(move |sess_idx| (sess_idx, &mut self.arena[sess_idx]))
    }

    // Returns an iterator visiting all sessions.
    //
    // Sessions are ordered by their names.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Session> + '_ {
        self.name_tree
            .values()
            .map(|sess_idx| &self.arena[*sess_idx])
    }

    // Returns a mutable iterator visiting all sessions.
    //
    // Iteration order is undefined.
    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &'_ mut Session> + '_ {
        self.arena.iter_mut().map(|(_, sess)| sess)
    }

    // Generates a new local discriminator: a random nonzero 32-bit value
    // not used by any other session.
    pub(crate) fn generate_discr(&self) -> u32 {
        loop {
            let discr = rand::rng().next_u32();
            if discr != 0 && !self.discr_tree.contains_key(&discr) {
                return discr;
            }
        }
    }

    // Replaces the local discriminator of the given session with a freshly
    // generated one, and returns it.
    pub(crate) fn reroll_discr(&mut self, sess_idx: SessionIndex) -> u32 {
        let local_discr = self.generate_discr();
        let old_discr = self.arena[sess_idx].state.local_discr;
        self.discr_tree.remove(&old_discr);
        self.discr_tree.insert(local_discr, sess_idx);
        local_discr
    }

    // Get next session ID.
    fn next_id(&mut self) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

impl std::ops::Index<SessionIndex> for Sessions {
    type Output = Session;

    fn index(&self, index: SessionIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl std::ops::IndexMut<SessionIndex> for Sessions {
    fn index_mut(&mut self, index: SessionIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}
