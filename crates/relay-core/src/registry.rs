//! Session and descriptor registry
//!
//! Three parallel structures sized once at startup: the poll row array
//! handed to `poll(2)`, the slot array mapping each row back to a
//! session track/direction, and the player table. Index 0 of the poll
//! array is the control descriptor and never moves. Removal punches
//! holes (`fd == -1`); the forwarding sweep compacts them lazily and the
//! per-track `sidx` back-indexes stay authoritative throughout.

use std::io;
use std::os::fd::RawFd;
use tracing::info;

use crate::session::{SessionRef, TrackKind};

/// What a poll row points at
pub struct PollSlot {
    pub session: SessionRef,
    pub track: TrackKind,
    pub dir: usize,
}

/// Global registry of live sessions and their pollable descriptors
pub struct Registry {
    /// Poll rows; `pfds[0]` is the control descriptor
    pfds: Vec<libc::pollfd>,
    /// Parallel back-pointers; `slots[0]` is always `None`
    slots: Vec<Option<PollSlot>>,
    /// Live prefix length of `pfds`/`slots`, including row 0
    nsessions: usize,
    /// Sessions with at least one active player
    players: Vec<Option<SessionRef>>,
    nplayers: usize,
    /// Rotating port allocator cursors, one per bind address
    pub next_port: [u16; 2],
    /// Total sessions ever created, for the info command
    pub sessions_created: u64,
}

impl Registry {
    /// Create a registry with fixed capacity, with the control
    /// descriptor installed at row 0.
    pub fn new(capacity: usize, control_fd: RawFd, port_min: u16) -> Self {
        let mut pfds = Vec::with_capacity(capacity);
        let mut slots = Vec::with_capacity(capacity);
        let mut players = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            pfds.push(libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            });
            slots.push(None);
            players.push(None);
        }
        pfds[0].fd = control_fd;
        pfds[0].events = libc::POLLIN;

        Self {
            pfds,
            slots,
            nsessions: 1,
            players,
            nplayers: 0,
            next_port: [port_min, port_min],
            sessions_created: 0,
        }
    }

    /// Number of live poll rows (control row included)
    pub fn nsessions(&self) -> usize {
        self.nsessions
    }

    /// Number of live player entries (holes included until compaction)
    pub fn nplayers(&self) -> usize {
        self.nplayers
    }

    /// Count of live media sessions, as reported by the info command
    pub fn active_sessions(&self) -> usize {
        (self.nsessions - 1) / 2
    }

    pub fn slot(&self, i: usize) -> Option<&PollSlot> {
        self.slots.get(i).and_then(|s| s.as_ref())
    }

    pub fn poll_fd(&self, i: usize) -> RawFd {
        self.pfds[i].fd
    }

    pub fn revents(&self, i: usize) -> i16 {
        self.pfds[i].revents
    }

    pub fn player(&self, i: usize) -> Option<&SessionRef> {
        self.players.get(i).and_then(|s| s.as_ref())
    }

    /// Install one track direction into the poll table, if its socket is
    /// bound. Mirrors the append step of session creation: absent
    /// sockets simply leave `sidx` unset.
    pub fn append(&mut self, sp: &SessionRef, track: TrackKind, dir: usize) {
        let fd = {
            let session = sp.borrow();
            session.track(track).sockets[dir]
                .as_ref()
                .map(std::os::fd::AsRawFd::as_raw_fd)
        };
        match fd {
            Some(fd) => {
                let i = self.nsessions;
                self.pfds[i] = libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                self.slots[i] = Some(PollSlot {
                    session: sp.clone(),
                    track,
                    dir,
                });
                sp.borrow_mut().track_mut(track).sidx[dir] = Some(i);
                self.nsessions += 1;
            }
            None => {
                sp.borrow_mut().track_mut(track).sidx[dir] = None;
            }
        }
    }

    /// Enter a session into the player table if it is not there already
    pub fn append_player(&mut self, sp: &SessionRef) {
        if sp.borrow().sridx.is_some() {
            return;
        }
        if !sp.borrow().playing() {
            sp.borrow_mut().sridx = None;
            return;
        }
        let i = self.nplayers;
        self.players[i] = Some(sp.clone());
        sp.borrow_mut().sridx = Some(i);
        self.nplayers += 1;
    }

    /// Punch the session's player-table slot
    pub fn clear_player(&mut self, sp: &SessionRef) {
        if let Some(i) = sp.borrow_mut().sridx.take() {
            self.players[i] = None;
        }
    }

    /// Tear down a session: log its totals, punch every poll row it
    /// owns, close its sockets, and drop its media state. The holes are
    /// compacted by the next forwarding sweep. The caller must not touch
    /// the session afterwards.
    pub fn remove_session(&mut self, sp: &SessionRef) {
        {
            let session = sp.borrow();
            session.log_stats();
        }
        let mut session = sp.borrow_mut();
        for track in [TrackKind::Rtp, TrackKind::Rtcp] {
            for dir in 0..2 {
                let t = session.track_mut(track);
                if let Some(i) = t.sidx[dir].take() {
                    debug_assert_eq!(
                        self.pfds[i].fd,
                        t.sockets[dir]
                            .as_ref()
                            .map(std::os::fd::AsRawFd::as_raw_fd)
                            .unwrap_or(-1)
                    );
                    self.pfds[i].fd = -1;
                    self.pfds[i].events = 0;
                    self.slots[i] = None;
                }
                // Close now rather than when the last handle drops
                t.sockets[dir] = None;
                t.remote[dir] = None;
                t.recorders[dir] = None;
            }
        }
        session.players = [None, None];
        if let Some(i) = session.sridx.take() {
            self.players[i] = None;
        }
    }

    /// Poll the live rows. Restartable: `EINTR` is surfaced as an error
    /// for the loop to retry.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::poll(
                self.pfds.as_mut_ptr(),
                self.nsessions as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    /// Shift row `from` down to row `to` during the compaction sweep and
    /// fix the owning track's back-index.
    pub fn shift_row(&mut self, from: usize, to: usize) {
        self.pfds[to] = self.pfds[from];
        let slot = self.slots[from].take();
        if let Some(slot) = &slot {
            slot.session.borrow_mut().track_mut(slot.track).sidx[slot.dir] = Some(to);
        }
        self.slots[to] = slot;
    }

    /// Finish a compaction sweep that found `holes` dead rows: truncate
    /// the live prefix and clear the leftover tail so no stale handles
    /// keep sessions alive.
    pub fn truncate_rows(&mut self, holes: usize) {
        let old = self.nsessions;
        self.nsessions -= holes;
        for i in self.nsessions..old {
            self.pfds[i].fd = -1;
            self.pfds[i].events = 0;
            self.pfds[i].revents = 0;
            self.slots[i] = None;
        }
    }

    /// Same for the player table
    pub fn shift_player(&mut self, from: usize, to: usize) {
        let entry = self.players[from].take();
        if let Some(sp) = &entry {
            sp.borrow_mut().sridx = Some(to);
        }
        self.players[to] = entry;
    }

    pub fn truncate_players(&mut self, holes: usize) {
        let old = self.nplayers;
        self.nplayers -= holes;
        for i in self.nplayers..old {
            self.players[i] = None;
        }
    }

    /// Log and remove a timed-out session (the 1 Hz reaper path)
    pub fn expire_session(&mut self, sp: &SessionRef) {
        info!(call_id = %sp.borrow().call_id, "session timeout");
        self.remove_session(sp);
    }
}
