use hashbrown::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// Reentrant multi-reader/single-writer lock.
///
/// Any number of threads may hold read access; one thread may hold write
/// access and can keep reading while it does. Depth counters are tracked per
/// thread, so a thread may re-enter read or write freely as long as every
/// enter is balanced by a leave (the guards do this). A thread holding only
/// read access may upgrade to write access iff no other thread currently
/// reads; two threads upgrading at the same time will deadlock, so writes
/// that contend must be taken as writes from the start.
pub struct MrswLock {
    state: Mutex<MrswState>,
    cond: Condvar,
}

struct MrswState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
    write_depth: usize,
}

impl MrswState {
    /// True when a thread other than `me` holds read access.
    fn other_readers(&self, me: ThreadId) -> bool {
        self.readers.keys().any(|&id| id != me)
    }
}

impl MrswLock {
    pub fn new() -> MrswLock {
        MrswLock {
            state: Mutex::new(MrswState {
                readers: HashMap::new(),
                writer: None,
                write_depth: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquires read access, blocking while another thread holds write
    /// access. A thread that already holds write access enters immediately.
    pub fn enter_read(&self) -> ReadGuard {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        while state.writer.map_or(false, |writer| writer != me) {
            state = self.cond.wait(state).unwrap();
        }

        *state.readers.entry(me).or_insert(0) += 1;
        ReadGuard { lock: self }
    }

    /// Acquires write access, blocking until every other thread's read depth
    /// reaches zero and no other writer is active. Re-enters immediately for
    /// a thread that already holds write access; upgrades for a thread whose
    /// read access is the only one outstanding.
    pub fn enter_write(&self) -> WriteGuard {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        loop {
            if state.writer == Some(me) {
                break;
            }
            if state.writer.is_none() && !state.other_readers(me) {
                state.writer = Some(me);
                break;
            }
            state = self.cond.wait(state).unwrap();
        }

        state.write_depth += 1;
        WriteGuard { lock: self }
    }

    fn leave_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        let depth = state
            .readers
            .get_mut(&me)
            .expect("leave_read without matching enter_read");
        *depth -= 1;

        if *depth == 0 {
            state.readers.remove(&me);
            self.cond.notify_all();
        }
    }

    fn leave_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        assert_eq!(
            state.writer,
            Some(me),
            "leave_write without matching enter_write"
        );
        state.write_depth -= 1;

        if state.write_depth == 0 {
            state.writer = None;
            self.cond.notify_all();
        }
    }
}

impl Default for MrswLock {
    fn default() -> Self {
        MrswLock::new()
    }
}

/// Read access; released on drop.
pub struct ReadGuard<'a> {
    lock: &'a MrswLock,
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        self.lock.leave_read();
    }
}

/// Write access; released on drop.
pub struct WriteGuard<'a> {
    lock: &'a MrswLock,
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        self.lock.leave_write();
    }
}
