//! Durable persistence of delivered payloads.

mod writer;

pub(crate) use writer::{PersistRecord, PersistWriter};
