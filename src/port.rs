//! MIDI Port — the seam around the OS-level MIDI port layer.
//! `MidiInputPort`/`MidiOutputPort` are the trait-level contract the
//! engine core depends on; [`VirtualMidiInput`]/[`VirtualMidiOutput`] are the
//! one concrete, `midir`-backed implementation, grounded in
//! `engine/midi_engine.rs` (`MidiOutput::create_virtual`, `send_note_on`/
//! `send_note_off`) and in `chrischaps-Modular`'s `MidiEvent::from_bytes`
//! byte-parsing for the input side.

use std::sync::mpsc;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::error::PortError;

/// One inbound MIDI message, already decoded from raw bytes. Channels are
/// 0-indexed (`0..=15`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    Clock,
    Start,
    Stop,
    Other,
}

impl RawMidiMessage {
    /// Parse a single MIDI message from raw bytes. Running status is
    /// handled upstream by the MIDI layer (`midir`), so every call here
    /// sees a full status byte.
    pub fn from_bytes(data: &[u8]) -> Self {
        let Some(&status) = data.first() else {
            return RawMidiMessage::Other;
        };

        match status {
            0xf8 => RawMidiMessage::Clock,
            0xfa => RawMidiMessage::Start,
            0xfc => RawMidiMessage::Stop,
            _ => {
                let channel = status & 0x0f;
                match status & 0xf0 {
                    0x90 if data.len() >= 3 => {
                        let note = data[1] & 0x7f;
                        let velocity = data[2] & 0x7f;
                        RawMidiMessage::NoteOn { channel, note, velocity }
                    }
                    0x80 if data.len() >= 3 => {
                        RawMidiMessage::NoteOff { channel, note: data[1] & 0x7f }
                    }
                    _ => RawMidiMessage::Other,
                }
            }
        }
    }
}

/// Blocking "receive next event" contract the coordinator polls.
pub trait MidiInputPort {
    fn recv(&mut self) -> Result<RawMidiMessage, PortError>;
}

/// Synchronous "send event" contract, one instance per pattern output.
pub trait MidiOutputPort {
    fn send_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), PortError>;
    fn send_note_off(&mut self, channel: u8, note: u8) -> Result<(), PortError>;
}

/// A virtual MIDI input port backed by `midir`. The input side of `midir`
/// is callback-driven, so the callback simply forwards parsed messages
/// across an `mpsc` channel, turning it back into the blocking
/// "receive next event" shape the rest of the engine expects.
pub struct VirtualMidiInput {
    // Kept alive only to hold the virtual port open; dropping it closes the port.
    _connection: MidiInputConnection<()>,
    receiver: mpsc::Receiver<RawMidiMessage>,
}

impl VirtualMidiInput {
    pub fn open(client_name: &str, port_name: &str) -> Result<Self, PortError> {
        let mut midi_in = MidiInput::new(client_name)
            .map_err(|e| PortError::Init(e.to_string()))?;
        // Clock/Start/Stop live in the "timing" category rtmidi ignores by
        // default; the engine needs every one of them.
        midi_in.ignore(Ignore::None);

        let (tx, rx) = mpsc::channel();
        let connection = midi_in
            .create_virtual(
                port_name,
                move |_timestamp_us, data, _| {
                    let msg = RawMidiMessage::from_bytes(data);
                    // The receiver outliving every sender for the engine's
                    // lifetime is an invariant of `VirtualMidiInput`; a
                    // closed receiver only happens during teardown, where a
                    // dropped message is harmless.
                    let _ = tx.send(msg);
                },
                (),
            )
            .map_err(|e| PortError::Connect(port_name.to_string(), e.to_string()))?;

        Ok(Self { _connection: connection, receiver: rx })
    }
}

impl MidiInputPort for VirtualMidiInput {
    fn recv(&mut self) -> Result<RawMidiMessage, PortError> {
        self.receiver
            .recv()
            .map_err(|_| PortError::Send("input port disconnected".to_string()))
    }
}

impl VirtualMidiInput {
    /// Like [`recv`](MidiInputPort::recv), but returns `Ok(None)` on
    /// timeout instead of blocking forever. Lets `main`'s loop wake up
    /// periodically to check the shutdown/reload flags between events.
    pub fn recv_timeout(&mut self, timeout: std::time::Duration) -> Result<Option<RawMidiMessage>, PortError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(PortError::Send("input port disconnected".to_string()))
            }
        }
    }
}

/// A virtual MIDI output port backed by `midir`, one per configured pattern.
pub struct VirtualMidiOutput {
    connection: MidiOutputConnection,
}

impl VirtualMidiOutput {
    pub fn open(client_name: &str, port_name: &str) -> Result<Self, PortError> {
        let midi_out = MidiOutput::new(client_name)
            .map_err(|e| PortError::Init(e.to_string()))?;
        let connection = midi_out
            .create_virtual(port_name)
            .map_err(|e| PortError::Connect(port_name.to_string(), e.to_string()))?;
        Ok(Self { connection })
    }
}

impl MidiOutputPort for VirtualMidiOutput {
    fn send_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), PortError> {
        let status = 0x90 | (channel & 0x0f);
        self.connection
            .send(&[status, note & 0x7f, velocity & 0x7f])
            .map_err(|e| PortError::Send(e.to_string()))
    }

    fn send_note_off(&mut self, channel: u8, note: u8) -> Result<(), PortError> {
        let status = 0x80 | (channel & 0x0f);
        self.connection
            .send(&[status, note & 0x7f, 0])
            .map_err(|e| PortError::Send(e.to_string()))
    }
}
