//! The pause-and-lock handshake.
//!
//! This is a handshake, not a resource lock: it does not protect any
//! shared memory by itself. The owner thread sets a pause request and
//! blocks until the render thread acknowledges at its next safe boundary
//! (between FIFO commands, never mid-command); the render thread then
//! holds there until the request is withdrawn. Calls must alternate
//! lock/unlock; nesting or unbalancing is a caller bug and is reported as
//! `ProtocolMisuse`.

use std::sync::{Condvar, Mutex};

use crate::error::VideoError;

#[derive(Default)]
struct PauseState {
    locked: bool,
    pause_requested: bool,
    acked: bool,
}

#[derive(Default)]
pub struct PauseLock {
    state: Mutex<PauseState>,
    cond: Condvar,
}

impl PauseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner thread: request a pause and block until the render thread
    /// acknowledges from its safe boundary.
    pub fn lock(&self) -> Result<(), VideoError> {
        let mut st = self.state.lock().expect("pause lock poisoned");
        if st.locked {
            return Err(VideoError::ProtocolMisuse(
                "pause_and_lock(true) while already locked",
            ));
        }
        st.locked = true;
        st.pause_requested = true;
        while !st.acked {
            st = self.cond.wait(st).expect("pause lock poisoned");
        }
        Ok(())
    }

    /// Owner thread: take the lock when no render thread is running to
    /// handshake with. The backend is quiescent by construction, so there
    /// is nothing to wait for, but nesting is still misuse.
    pub fn lock_idle(&self) -> Result<(), VideoError> {
        let mut st = self.state.lock().expect("pause lock poisoned");
        if st.locked {
            return Err(VideoError::ProtocolMisuse(
                "pause_and_lock(true) while already locked",
            ));
        }
        st.locked = true;
        Ok(())
    }

    /// Owner thread: release the lock. With `unpause` the render thread
    /// resumes its loop; without it the render thread stays held at the
    /// safe boundary until a later `unlock(true)` cycle releases it.
    pub fn unlock(&self, unpause: bool) -> Result<(), VideoError> {
        let mut st = self.state.lock().expect("pause lock poisoned");
        if !st.locked {
            return Err(VideoError::ProtocolMisuse(
                "pause_and_lock(false) without a matching lock",
            ));
        }
        st.locked = false;
        if unpause {
            st.pause_requested = false;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Owner thread: withdraw any outstanding pause request and wake a
    /// parked render thread. Called on render-loop teardown so an exit
    /// flag set after `unlock(false)` can still be observed.
    pub fn release_for_exit(&self) {
        let mut st = self.state.lock().expect("pause lock poisoned");
        st.pause_requested = false;
        self.cond.notify_all();
    }

    /// True while a pause request keeps the render thread at its safe
    /// point. Stays true across `unlock(false)`, which releases the lock
    /// without resuming the loop.
    pub fn is_pause_requested(&self) -> bool {
        self.state.lock().expect("pause lock poisoned").pause_requested
    }

    /// Render thread: the safe boundary between command executions. If a
    /// pause is requested, acknowledge it and hold here until released.
    pub fn render_safe_point(&self) {
        let mut st = self.state.lock().expect("pause lock poisoned");
        if st.pause_requested {
            st.acked = true;
            self.cond.notify_all();
            while st.pause_requested {
                st = self.cond.wait(st).expect("pause lock poisoned");
            }
            st.acked = false;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().expect("pause lock poisoned").locked
    }
}
