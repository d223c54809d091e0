//! Clock & Transport Decoder — classifies one inbound MIDI message into the
//! decision the coordinator dispatches on. Pure, stateless.

use crate::port::RawMidiMessage;

/// Coordinator-level decision for one inbound MIDI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ClockPulse,
    Start,
    Stop,
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    Ignore,
}

/// Classify `msg` against the configured `input_channel` (0-indexed,
/// `0..=15`). Clock/Start/Stop are channel-agnostic; note events are
/// filtered to `input_channel` and otherwise ignored.
pub fn decode(msg: RawMidiMessage, input_channel: u8) -> Decision {
    match msg {
        RawMidiMessage::Clock => Decision::ClockPulse,
        RawMidiMessage::Start => Decision::Start,
        RawMidiMessage::Stop => Decision::Stop,
        RawMidiMessage::NoteOn { channel, note, velocity } if channel == input_channel => {
            if velocity == 0 {
                Decision::NoteOff { note }
            } else {
                Decision::NoteOn { note, velocity }
            }
        }
        RawMidiMessage::NoteOff { channel, note } if channel == input_channel => {
            Decision::NoteOff { note }
        }
        _ => Decision::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_channel_agnostic() {
        assert_eq!(decode(RawMidiMessage::Clock, 5), Decision::ClockPulse);
    }

    #[test]
    fn start_stop_are_channel_agnostic() {
        assert_eq!(decode(RawMidiMessage::Start, 0), Decision::Start);
        assert_eq!(decode(RawMidiMessage::Stop, 0), Decision::Stop);
    }

    #[test]
    fn note_on_velocity_zero_becomes_note_off() {
        let msg = RawMidiMessage::NoteOn { channel: 0, note: 60, velocity: 0 };
        assert_eq!(decode(msg, 0), Decision::NoteOff { note: 60 });
    }

    #[test]
    fn note_on_matching_channel() {
        let msg = RawMidiMessage::NoteOn { channel: 2, note: 64, velocity: 100 };
        assert_eq!(decode(msg, 2), Decision::NoteOn { note: 64, velocity: 100 });
    }

    #[test]
    fn note_events_on_other_channel_are_ignored() {
        let msg = RawMidiMessage::NoteOn { channel: 3, note: 64, velocity: 100 };
        assert_eq!(decode(msg, 0), Decision::Ignore);
    }

    #[test]
    fn unsupported_message_is_ignored() {
        assert_eq!(decode(RawMidiMessage::Other, 0), Decision::Ignore);
    }
}
