// AI assistant conversation orchestrator.
// Client side: identity → session state machine → transport.
// Server side: locator → context → invoker → interpreter → persistence, sequenced by turn.

pub mod context;
pub mod handlers;
pub mod identity;
pub mod interpreter;
pub mod invoker;
pub mod locator;
pub mod persistence;
pub mod resume_store;
pub mod session;
pub mod transport;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;
