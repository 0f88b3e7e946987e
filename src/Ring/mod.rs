mod builder;
mod consumer;
mod producer;

pub use builder::EmitterBuilder;
pub use consumer::{FlushReport, FlusherHandle};
pub use producer::{EmitOutcome, EventEmitter};

pub mod Buffer {
    pub mod Buffer;
    pub mod Buffer_impl;
    pub mod layout;
    pub use Buffer::{RingBuffer, Slot, SlotState, MAX_CLAIM_ATTEMPTS}; // re-export for stable path
    pub use Buffer_impl::{Drain, RingReader};
}

pub mod Structs {
    pub mod Event_Structs;
    pub use Event_Structs::{
        DecodedEvent, Event, EventKind, Field, FieldValue, OwnedValue, RecordHeader, HEADER_LEN,
    }; // re-export for stable path
}
