//! Domain event abstraction shared by deciders, evolvers and the event store.

pub mod envelope;
pub mod event;

pub use envelope::EventEnvelope;
pub use event::Event;
