//! Engine Coordinator — owns the chord buffer and every pattern's runtime,
//! dispatches decoded MIDI events, and drives config reload.
//!
//! Grounded in `engine/midi_engine.rs`'s run loop (one blocking-receive
//! loop pumping a command/event channel into per-voice state) and in
//! `original_source/midi_router.py`'s `main()` (the clock handler
//! iterating every pattern in document order on each pulse).

use std::collections::HashSet;

use rand::Rng;

use crate::chord::ChordBuffer;
use crate::decoder::{decode, Decision};
use crate::model::PatternConfig;
use crate::port::{MidiInputPort, MidiOutputPort};
use crate::sequencer::{MidiAction, PatternRuntime};

/// One configured pattern plus its runtime state and dedicated output port.
pub struct Pattern {
    pub config: PatternConfig,
    runtime: PatternRuntime,
    output: Box<dyn MidiOutputPort>,
}

impl Pattern {
    pub fn new(config: PatternConfig, output: Box<dyn MidiOutputPort>) -> Self {
        let runtime = PatternRuntime::new(config.length);
        Self { config, runtime, output }
    }

    fn apply(&mut self, actions: Vec<MidiAction>) {
        for action in actions {
            let result = match action {
                MidiAction::NoteOn { note, velocity } => {
                    self.output.send_note_on(self.config.output_channel, note, velocity)
                }
                MidiAction::NoteOff { note } => {
                    self.output.send_note_off(self.config.output_channel, note)
                }
            };
            // A send failure here is a port-level failure, not something a
            // single pattern should swallow silently, but it also shouldn't
            // panic mid-loop and take every other pattern down with it.
            if let Err(e) = result {
                log::warn!("pattern {:?}: failed to send MIDI message: {e}", self.config.name);
            }
        }
    }

    fn release(&mut self) {
        let actions = self.runtime.force_release();
        self.apply(actions);
    }
}

/// Input/transport/chord state plus the full set of pattern runtimes.
/// The core engine never touches `midir` directly — only the
/// [`MidiOutputPort`] trait objects each [`Pattern`] holds.
pub struct EngineCoordinator {
    input_channel: u8,
    chord: ChordBuffer,
    patterns: Vec<Pattern>,
}

impl EngineCoordinator {
    pub fn new(input_channel: u8, patterns: Vec<Pattern>) -> Self {
        Self { input_channel, chord: ChordBuffer::new(), patterns }
    }

    /// Decode one raw inbound message and dispatch it. Returns once the
    /// message has been fully processed.
    pub fn handle_message(&mut self, msg: crate::port::RawMidiMessage, rng: &mut impl Rng) {
        match decode(msg, self.input_channel) {
            Decision::ClockPulse => self.on_clock_pulse(rng),
            Decision::Start => self.on_start(rng),
            Decision::Stop => self.on_stop(),
            Decision::NoteOn { note, velocity } => self.on_note_on(note, velocity, rng),
            Decision::NoteOff { note } => self.on_note_off(note),
            Decision::Ignore => {}
        }
    }

    fn on_note_on(&mut self, note: u8, _velocity: u8, rng: &mut impl Rng) {
        let was_empty = self.chord.is_empty();
        self.chord.insert(note);
        if was_empty && !self.chord.is_empty() {
            // Chord-enter rule: every pattern resets to step 0 and fires
            // immediately rather than waiting out its own accumulator, so
            // the arpeggio is audible the instant a chord is held.
            for pattern in &mut self.patterns {
                pattern.runtime.reset_cursor(pattern.config.length);
                if !pattern.config.enabled {
                    continue;
                }
                let actions = pattern.runtime.fire_immediate(&pattern.config, &self.chord, rng);
                pattern.apply(actions);
            }
        }
    }

    fn on_note_off(&mut self, note: u8) {
        self.chord.remove(note);
        if self.chord.is_empty() {
            for pattern in &mut self.patterns {
                pattern.release();
            }
        }
    }

    fn on_clock_pulse(&mut self, rng: &mut impl Rng) {
        if self.chord.is_empty() {
            // Spurious clock without a chord: not an error, just nothing
            // to advance. Still run the clock tail so any note still
            // ringing out from the instant the chord emptied gets
            // released on schedule rather than left hanging.
            for pattern in &mut self.patterns {
                pattern.release();
            }
            return;
        }
        for pattern in &mut self.patterns {
            if !pattern.config.enabled {
                continue;
            }
            let actions = pattern.runtime.on_clock_pulse(&pattern.config, &self.chord, rng);
            pattern.apply(actions);
        }
    }

    fn on_start(&mut self, rng: &mut impl Rng) {
        for pattern in &mut self.patterns {
            pattern.release();
            pattern.runtime.reset_cursor(pattern.config.length);
        }
        if !self.chord.is_empty() {
            for pattern in &mut self.patterns {
                if !pattern.config.enabled {
                    continue;
                }
                let actions = pattern.runtime.fire_immediate(&pattern.config, &self.chord, rng);
                pattern.apply(actions);
            }
        }
    }

    fn on_stop(&mut self) {
        for pattern in &mut self.patterns {
            pattern.release();
            pattern.runtime.reset_cursor(pattern.config.length);
        }
    }

    /// Replace every pattern's configuration and runtime in one atomic
    /// step. Sounding notes are released first so a reload never leaves a
    /// stuck note hanging on the old configuration's channel, and it
    /// never happens mid-fire because the coordinator only calls this
    /// between `handle_message` invocations.
    pub fn reload(&mut self, input_channel: u8, configs: Vec<(PatternConfig, Box<dyn MidiOutputPort>)>) {
        for pattern in &mut self.patterns {
            pattern.release();
        }
        self.input_channel = input_channel;
        self.patterns = configs
            .into_iter()
            .map(|(config, output)| Pattern::new(config, output))
            .collect();
    }

    pub fn pattern_names(&self) -> HashSet<&str> {
        self.patterns.iter().map(|p| p.config.name.as_str()).collect()
    }

    /// Emit a note-off for every sounding/pending note across all patterns.
    /// Called once on process termination, before the output ports close.
    pub fn shutdown(&mut self) {
        for pattern in &mut self.patterns {
            pattern.release();
        }
    }

    #[cfg(test)]
    pub fn chord_size(&self) -> usize {
        self.chord.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GateEntry, RandOctave, StepDescriptor, VelocityEntry};
    use crate::port::RawMidiMessage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingOutput {
        sent: Arc<Mutex<Vec<(u8, u8, Option<u8>)>>>, // (channel, note, Some(velocity) | None for off)
    }

    impl MidiOutputPort for RecordingOutput {
        fn send_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), crate::error::PortError> {
            self.sent.lock().unwrap().push((channel, note, Some(velocity)));
            Ok(())
        }
        fn send_note_off(&mut self, channel: u8, note: u8) -> Result<(), crate::error::PortError> {
            self.sent.lock().unwrap().push((channel, note, None));
            Ok(())
        }
    }

    fn simple_config(name: &str, channel: u8) -> PatternConfig {
        PatternConfig {
            name: name.to_string(),
            length: 2,
            steps: vec![StepDescriptor::Fixed(1), StepDescriptor::Fixed(2)],
            velocity: vec![VelocityEntry::Fixed(100); 2],
            v_random: vec![0; 2],
            s_prob: vec![100; 2],
            s_oct: vec![0; 2],
            r_oct: vec![RandOctave::zero(); 2],
            gate: vec![GateEntry::Percent(50); 2],
            global_octave: 0,
            division: "1/16".to_string(),
            pulses_per_step: 6.0,
            enabled: true,
            output_channel: channel,
            silent_on_out_of_range: false,
        }
    }

    #[test]
    fn chord_empty_releases_all_sounding_notes_within_one_event() {
        let recorder = RecordingOutput::default();
        let pattern = Pattern::new(simple_config("Pattern 1", 0), Box::new(recorder.clone()));
        let mut engine = EngineCoordinator::new(0, vec![pattern]);
        let mut rng = StdRng::seed_from_u64(1);

        engine.handle_message(RawMidiMessage::Start, &mut rng);
        engine.handle_message(RawMidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 }, &mut rng);
        assert_eq!(engine.chord_size(), 1);

        engine.handle_message(RawMidiMessage::NoteOff { channel: 0, note: 60 }, &mut rng);
        assert_eq!(engine.chord_size(), 0);

        let sent = recorder.sent.lock().unwrap();
        assert!(sent.iter().any(|(_, _, v)| v.is_none()), "expected a note-off on chord-empty");
    }

    #[test]
    fn note_on_note_off_balance_at_shutdown() {
        let recorder = RecordingOutput::default();
        let pattern = Pattern::new(simple_config("Pattern 1", 0), Box::new(recorder.clone()));
        let mut engine = EngineCoordinator::new(0, vec![pattern]);
        let mut rng = StdRng::seed_from_u64(2);

        engine.handle_message(RawMidiMessage::Start, &mut rng);
        engine.handle_message(RawMidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 }, &mut rng);
        for _ in 0..20 {
            engine.handle_message(RawMidiMessage::Clock, &mut rng);
        }
        engine.on_stop();

        let sent = recorder.sent.lock().unwrap();
        let ons = sent.iter().filter(|(_, _, v)| v.is_some()).count();
        let offs = sent.iter().filter(|(_, _, v)| v.is_none()).count();
        assert_eq!(ons, offs, "every note-on must be matched by a note-off by shutdown");
    }

    #[test]
    fn disabled_pattern_never_emits() {
        let recorder = RecordingOutput::default();
        let mut cfg = simple_config("Pattern 1", 0);
        cfg.enabled = false;
        let pattern = Pattern::new(cfg, Box::new(recorder.clone()));
        let mut engine = EngineCoordinator::new(0, vec![pattern]);
        let mut rng = StdRng::seed_from_u64(3);

        engine.handle_message(RawMidiMessage::Start, &mut rng);
        engine.handle_message(RawMidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 }, &mut rng);
        for _ in 0..20 {
            engine.handle_message(RawMidiMessage::Clock, &mut rng);
        }
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn clock_runs_without_an_explicit_start() {
        // The arpeggiator needs no Start/Stop messages at all: holding a
        // chord and feeding clock pulses is enough, matching the original
        // router's "doesn't require Start/Stop" behavior.
        let recorder = RecordingOutput::default();
        let pattern = Pattern::new(simple_config("Pattern 1", 0), Box::new(recorder.clone()));
        let mut engine = EngineCoordinator::new(0, vec![pattern]);
        let mut rng = StdRng::seed_from_u64(4);

        engine.handle_message(RawMidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 }, &mut rng);
        // Chord-enter rule fires the first step immediately, no clock needed.
        assert!(!recorder.sent.lock().unwrap().is_empty());
        for _ in 0..20 {
            engine.handle_message(RawMidiMessage::Clock, &mut rng);
        }
        let sent = recorder.sent.lock().unwrap();
        assert!(sent.iter().any(|(_, note, v)| *note == 64 && v.is_some()), "step 2 should have fired without Start");
    }

    #[test]
    fn clock_without_any_chord_ever_held_emits_nothing() {
        let recorder = RecordingOutput::default();
        let pattern = Pattern::new(simple_config("Pattern 1", 0), Box::new(recorder.clone()));
        let mut engine = EngineCoordinator::new(0, vec![pattern]);
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..48 {
            engine.handle_message(RawMidiMessage::Clock, &mut rng);
        }
        assert!(recorder.sent.lock().unwrap().is_empty());
    }
}
