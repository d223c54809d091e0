//! TR Router — real-time MIDI arpeggiator and router.
//!
//! The engine (`chord`, `division`, `sequencer`, `decoder`, `engine`) is
//! pure and port-agnostic; `port` is the one seam where `midir` enters,
//! `config` turns a JSON document into the engine's data model, and
//! `lock` implements the single-instance sentinel the binary runs at
//! startup. `main.rs` wires all of it together.

pub mod chord;
pub mod config;
pub mod decoder;
pub mod division;
pub mod engine;
pub mod error;
pub mod lock;
pub mod model;
pub mod port;
pub mod sequencer;
