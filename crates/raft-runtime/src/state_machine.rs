//! # state_machine
//!
//! why: the engine replicates opaque bytes; meaning is given by whoever applies them
//! relations: called by engine.rs once per committed index, in index order
//! what: StateMachine trait, closure impl

use raft_core::LogIndex;

/// Receives committed commands exactly once each, in increasing index order
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, index: LogIndex, command: &[u8]);
}

impl<F> StateMachine for F
where
    F: FnMut(LogIndex, &[u8]) + Send + 'static,
{
    fn apply(&mut self, index: LogIndex, command: &[u8]) {
        self(index, command)
    }
}
