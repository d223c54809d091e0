//! Pattern Sequencer + Step Evaluator + Gate/Tie State Machine.
//!
//! One [`PatternRuntime`] exists per configured output pattern and is wholly
//! independent of every other pattern's runtime: each owns its own pulse
//! accumulator, step cursor, per-cycle random cache, and note-lifecycle
//! state. [`fire_step`] implements the fire procedure and the gate/tie
//! transition table in one pass; the coordinator (`crate::engine`) drives
//! the clock accumulation and the clock tail around it.

use rand::Rng;

use crate::chord::ChordBuffer;
use crate::model::{GateEntry, PatternConfig, RandOctave, StepDescriptor, VelocityEntry};

/// A note-on or note-off the coordinator must forward to this pattern's
/// output port, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiAction {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
}

#[derive(Debug, Clone, Copy)]
enum GateRemaining {
    Pulses(f64),
    Sustain,
}

#[derive(Debug, Clone, Copy)]
struct SoundingNote {
    note: u8,
    tied: bool,
    gate: GateRemaining,
}

#[derive(Debug, Clone, Copy)]
struct PendingOff {
    note: u8,
    remaining: u32,
}

/// Mutable runtime state owned by one pattern's sequencer.
#[derive(Debug, Clone)]
pub struct PatternRuntime {
    pulse_accum: f64,
    step_cursor: usize,
    cycle_random_steps: Vec<Option<u8>>,
    cycle_random_velocities: Vec<Option<u8>>,
    sounding_note: Option<SoundingNote>,
    pending_off: Option<PendingOff>,
}

impl PatternRuntime {
    pub fn new(length: usize) -> Self {
        Self {
            pulse_accum: 0.0,
            step_cursor: 0,
            cycle_random_steps: vec![None; length],
            cycle_random_velocities: vec![None; length],
            sounding_note: None,
            pending_off: None,
        }
    }

    /// Reset to the state of a fresh chord-enter / transport Start:
    /// cursor and accumulator to zero, caches cleared. Does NOT touch
    /// `sounding_note`/`pending_off` — callers release those first via
    /// [`force_release`](Self::force_release) when a full release is also
    /// required.
    pub fn reset_cursor(&mut self, length: usize) {
        self.pulse_accum = 0.0;
        self.step_cursor = 0;
        self.cycle_random_steps = vec![None; length];
        self.cycle_random_velocities = vec![None; length];
    }

    pub fn step_cursor(&self) -> usize {
        self.step_cursor
    }

    pub fn has_sounding_note(&self) -> bool {
        self.sounding_note.is_some()
    }

    pub fn has_pending_off(&self) -> bool {
        self.pending_off.is_some()
    }

    /// Unconditionally release whatever is sounding or pending, emitting
    /// the matching note-offs. Used on chord-empty, Stop, shutdown, and
    /// config reload.
    pub fn force_release(&mut self) -> Vec<MidiAction> {
        let mut actions = Vec::new();
        if let Some(sounding) = self.sounding_note.take() {
            actions.push(MidiAction::NoteOff { note: sounding.note });
        }
        if let Some(pending) = self.pending_off.take() {
            actions.push(MidiAction::NoteOff { note: pending.note });
        }
        actions
    }

    /// Advance the pulse accumulator by one clock pulse and fire as many
    /// steps as the division threshold allows (normally zero or one; never
    /// more than one, since `pulses_per_step >= 1.0`).
    ///
    /// The clock tail runs *before* this pulse's fire, not after: it only
    /// ever decrements a gate/pending countdown that was already ticking
    /// going into this pulse, never one this same fire just set. A step
    /// that sets `gate_remaining = N` releases N pulses later, and a
    /// tied transition's 1-pulse overlap lands on the very next pulse, not
    /// this one.
    pub fn on_clock_pulse(
        &mut self,
        cfg: &PatternConfig,
        chord: &ChordBuffer,
        rng: &mut impl Rng,
    ) -> Vec<MidiAction> {
        let mut actions = self.clock_tail();
        self.pulse_accum += 1.0;
        if self.pulse_accum >= cfg.pulses_per_step {
            self.pulse_accum -= cfg.pulses_per_step;
            actions.extend(fire_step(self, cfg, chord, rng));
        }
        actions
    }

    /// The per-pulse gate/pending-off countdown ("clock tail"), run once
    /// per clock pulse, before that same pulse's fire step.
    fn clock_tail(&mut self) -> Vec<MidiAction> {
        let mut actions = Vec::new();

        if let Some(sounding) = &mut self.sounding_note {
            if let GateRemaining::Pulses(remaining) = &mut sounding.gate {
                *remaining -= 1.0;
                if *remaining <= 0.0 {
                    let note = sounding.note;
                    self.sounding_note = None;
                    actions.push(MidiAction::NoteOff { note });
                }
            }
        }

        if let Some(pending) = &mut self.pending_off {
            pending.remaining = pending.remaining.saturating_sub(1);
            if pending.remaining == 0 {
                let note = pending.note;
                self.pending_off = None;
                actions.push(MidiAction::NoteOff { note });
            }
        }

        actions
    }

    /// Fire one step immediately, bypassing pulse accumulation. Used for
    /// the "first-step-on-chord" rule on chord-enter and on transport
    /// Start.
    pub fn fire_immediate(
        &mut self,
        cfg: &PatternConfig,
        chord: &ChordBuffer,
        rng: &mut impl Rng,
    ) -> Vec<MidiAction> {
        fire_step(self, cfg, chord, rng)
    }
}

/// The fire-step procedure plus the gate/tie transition that follows it,
/// in one pass. Always advances `step_cursor` by exactly one step
/// regardless of which branch is taken (Rest, probability miss, or
/// out-of-range note).
fn fire_step(
    rt: &mut PatternRuntime,
    cfg: &PatternConfig,
    chord: &ChordBuffer,
    rng: &mut impl Rng,
) -> Vec<MidiAction> {
    let length = cfg.length;
    let step_pos = rt.step_cursor % length;

    if step_pos == 0 {
        rt.cycle_random_steps = vec![None; length];
        rt.cycle_random_velocities = vec![None; length];
    }

    let advance = |rt: &mut PatternRuntime| {
        rt.step_cursor = (rt.step_cursor + 1) % length;
    };

    let roll: u8 = rng.gen_range(1..=100);
    if roll > cfg.s_prob[step_pos] {
        advance(rt);
        return Vec::new();
    }

    let chord_size = chord.size();

    let mut idx = match cfg.step_at(step_pos) {
        StepDescriptor::Rest => {
            advance(rt);
            return Vec::new();
        }
        StepDescriptor::Random => {
            if rt.cycle_random_steps[step_pos].is_none() {
                rt.cycle_random_steps[step_pos] = Some(rng.gen_range(1..=chord_size as u8));
            }
            rt.cycle_random_steps[step_pos].unwrap()
        }
        StepDescriptor::Fixed(k) => k,
    };

    if idx == 0 || idx as usize > chord_size {
        if cfg.silent_on_out_of_range {
            advance(rt);
            return Vec::new();
        }
        // Salvage: never silence a Fixed step just because the chord
        // shrank; resample uniformly in range instead.
        idx = rng.gen_range(1..=chord_size as u8);
    }

    let base_note = match chord.at(idx as usize) {
        Some(n) => n,
        None => {
            advance(rt);
            return Vec::new();
        }
    };

    let base_velocity: u8 = match cfg.velocity[step_pos] {
        VelocityEntry::Fixed(v) => v,
        VelocityEntry::Random => {
            if rt.cycle_random_velocities[step_pos].is_none() {
                rt.cycle_random_velocities[step_pos] = Some(rng.gen_range(1..=127));
            }
            rt.cycle_random_velocities[step_pos].unwrap()
        }
    };
    let velocity = apply_velocity_jitter(base_velocity, cfg.v_random[step_pos], rng);

    let rand_oct = resolve_rand_octave(cfg.r_oct[step_pos], rng);
    let octave_semitones =
        12 * (cfg.global_octave as i32 + cfg.s_oct[step_pos] as i32 + rand_oct as i32);
    let note = base_note as i32 + octave_semitones;

    if !(0..=127).contains(&note) {
        advance(rt);
        return Vec::new();
    }
    let note = note as u8;

    let gate_pulses = match cfg.gate[step_pos] {
        GateEntry::Percent(pct) => {
            let pulses = cfg.pulses_per_step * (pct as f64) / 100.0;
            Some(pulses.max(1.0))
        }
        GateEntry::Tie => None,
    };
    let tie = gate_pulses.is_none();
    let gate_pulses = gate_pulses.unwrap_or(0.0);

    let actions = apply_gate_transition(rt, note, velocity, tie, gate_pulses);
    advance(rt);
    actions
}

/// The gate/tie transition table, collapsed: the `new_note == sounding`
/// and "from Idle" rows both reduce to "update tied/gate in place, emit
/// nothing but a NoteOn if nothing was sounding"; the `new_note != sounding`
/// rows both reduce to "overlap via pending_off iff either side ties,
/// otherwise cut cleanly".
fn apply_gate_transition(
    rt: &mut PatternRuntime,
    new_note: u8,
    velocity: u8,
    tie: bool,
    gate_pulses: f64,
) -> Vec<MidiAction> {
    let mut actions = Vec::new();
    let new_gate = if tie { GateRemaining::Sustain } else { GateRemaining::Pulses(gate_pulses) };

    match rt.sounding_note.take() {
        None => {
            actions.push(MidiAction::NoteOn { note: new_note, velocity });
            rt.sounding_note = Some(SoundingNote { note: new_note, tied: tie, gate: new_gate });
        }
        Some(SoundingNote { note, .. }) if note == new_note => {
            rt.sounding_note = Some(SoundingNote { note, tied: tie, gate: new_gate });
        }
        Some(SoundingNote { note: old_note, tied: old_tied, .. }) => {
            let overlap = old_tied || tie;
            if overlap {
                if let Some(old_pending) = rt.pending_off.take() {
                    // Two tied transitions landed within the same pending
                    // window: flush the older release immediately rather
                    // than silently dropping it.
                    actions.push(MidiAction::NoteOff { note: old_pending.note });
                }
                rt.pending_off = Some(PendingOff { note: old_note, remaining: 1 });
            } else {
                actions.push(MidiAction::NoteOff { note: old_note });
            }
            actions.push(MidiAction::NoteOn { note: new_note, velocity });
            rt.sounding_note = Some(SoundingNote { note: new_note, tied: tie, gate: new_gate });
        }
    }

    actions
}

fn apply_velocity_jitter(base: u8, v_random: u8, rng: &mut impl Rng) -> u8 {
    if v_random >= 100 {
        rng.gen_range(1..=127)
    } else if v_random > 0 {
        let span = (v_random as u32 * 127) / 100;
        let half = (span / 2) as i32;
        let low = (base as i32 - half).max(1);
        let high = (base as i32 + half).min(127);
        rng.gen_range(low..=high) as u8
    } else {
        base
    }
}

fn resolve_rand_octave(spec: RandOctave, rng: &mut impl Rng) -> i8 {
    match spec {
        RandOctave::Fixed(k) => k,
        RandOctave::Bipolar(k) => if rng.gen_bool(0.5) { k } else { -k },
        RandOctave::Range(k) => {
            if k == 0 {
                0
            } else {
                rng.gen_range(-k..=k)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GateEntry, PatternConfig, RandOctave, StepDescriptor, VelocityEntry};
    use rand::rngs::mock::StepRng;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn base_config(length: usize) -> PatternConfig {
        PatternConfig {
            name: "Test".to_string(),
            length,
            steps: (1..=length as u8).map(StepDescriptor::Fixed).collect(),
            velocity: vec![VelocityEntry::Fixed(100); length],
            v_random: vec![0; length],
            s_prob: vec![100; length],
            s_oct: vec![0; length],
            r_oct: vec![RandOctave::zero(); length],
            gate: vec![GateEntry::Percent(50); length],
            global_octave: 0,
            division: "1/16".to_string(),
            pulses_per_step: 6.0,
            enabled: true,
            output_channel: 0,
            silent_on_out_of_range: false,
        }
    }

    fn chord(notes: &[u8]) -> ChordBuffer {
        let mut c = ChordBuffer::new();
        for &n in notes {
            c.insert(n);
        }
        c
    }

    #[test]
    fn ascending_pattern_emits_and_releases_on_gate() {
        let cfg = base_config(3);
        let mut rt = PatternRuntime::new(3);
        let c = chord(&[60, 64, 67]);
        let mut rng = StdRng::seed_from_u64(1);

        let first = rt.fire_immediate(&cfg, &c, &mut rng);
        assert_eq!(first, vec![MidiAction::NoteOn { note: 60, velocity: 100 }]);

        // gate 50% of 6 pulses = 3 pulses; note-off after 3 clock pulses.
        let mut offs = 0;
        for _ in 0..6 {
            let actions = rt.on_clock_pulse(&cfg, &c, &mut rng);
            offs += actions.iter().filter(|a| matches!(a, MidiAction::NoteOff { .. })).count();
        }
        assert_eq!(offs, 1);
    }

    #[test]
    fn rest_step_advances_without_emission() {
        let mut cfg = base_config(2);
        cfg.steps = vec![StepDescriptor::Fixed(1), StepDescriptor::Rest];
        cfg.gate = vec![GateEntry::Percent(100), GateEntry::Percent(100)];
        cfg.pulses_per_step = 12.0;
        let mut rt = PatternRuntime::new(2);
        let c = chord(&[60, 64]);
        let mut rng = StdRng::seed_from_u64(2);

        let first = rt.fire_immediate(&cfg, &c, &mut rng);
        assert_eq!(first, vec![MidiAction::NoteOn { note: 60, velocity: 100 }]);

        // pulse 12 fires the rest step: no emission, sounding note unaffected.
        let mut saw_emission = false;
        for _ in 0..12 {
            let actions = rt.on_clock_pulse(&cfg, &c, &mut rng);
            if !actions.is_empty() {
                saw_emission = true;
            }
        }
        assert!(!saw_emission, "rest step + still-gated note should not emit");
        assert!(rt.has_sounding_note());
    }

    #[test]
    fn tied_transition_overlaps_one_pulse() {
        let mut cfg = base_config(2);
        cfg.steps = vec![StepDescriptor::Fixed(1), StepDescriptor::Fixed(2)];
        cfg.gate = vec![GateEntry::Tie, GateEntry::Percent(50)];
        cfg.pulses_per_step = 6.0;
        let mut rt = PatternRuntime::new(2);
        let c = chord(&[60, 64]);
        let mut rng = StdRng::seed_from_u64(3);

        let first = rt.fire_immediate(&cfg, &c, &mut rng);
        assert_eq!(first, vec![MidiAction::NoteOn { note: 60, velocity: 100 }]);

        let mut note_offs = Vec::new();
        let mut note_ons = Vec::new();
        for _ in 0..10 {
            for action in rt.on_clock_pulse(&cfg, &c, &mut rng) {
                match action {
                    MidiAction::NoteOff { note } => note_offs.push(note),
                    MidiAction::NoteOn { note, .. } => note_ons.push(note),
                }
            }
        }
        // Step 1 (index 2, note 64) fires at pulse 6, scheduling note 60's
        // release one pulse later; note 64's own 50%-of-6=3 pulse gate
        // releases it at pulse 9.
        assert_eq!(note_ons, vec![64]);
        assert_eq!(note_offs, vec![60, 64]);
    }

    #[test]
    fn zero_probability_never_emits() {
        let mut cfg = base_config(2);
        cfg.s_prob = vec![0, 0];
        let mut rt = PatternRuntime::new(2);
        let c = chord(&[60]);
        let mut rng = StepRng::new(0, 1);

        for _ in 0..1000 {
            let actions = rt.fire_immediate(&cfg, &c, &mut rng);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn random_step_resamples_every_cycle() {
        let mut cfg = base_config(1);
        cfg.steps = vec![StepDescriptor::Random];
        let mut rt = PatternRuntime::new(1);
        let c = chord(&[60, 64, 67]);
        let mut rng = StdRng::seed_from_u64(42);

        let mut seen_notes = std::collections::HashSet::new();
        for _ in 0..50 {
            for action in rt.fire_immediate(&cfg, &c, &mut rng) {
                if let MidiAction::NoteOn { note, .. } = action {
                    seen_notes.insert(note);
                }
                if let MidiAction::NoteOff { note } = action {
                    let _ = note;
                }
            }
        }
        assert!(seen_notes.len() > 1, "random step should vary across cycles");
        assert!(seen_notes.iter().all(|n| [60u8, 64, 67].contains(n)));
    }

    #[test]
    fn step_cursor_always_in_range() {
        let cfg = base_config(4);
        let mut rt = PatternRuntime::new(4);
        let c = chord(&[60, 64, 67, 71]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            rt.fire_immediate(&cfg, &c, &mut rng);
            assert!(rt.step_cursor() < cfg.length);
        }
    }

    #[test]
    fn out_of_range_note_skips_emission_but_advances() {
        let mut cfg = base_config(1);
        cfg.global_octave = 5;
        cfg.s_oct = vec![2];
        let mut rt = PatternRuntime::new(1);
        let c = chord(&[120]);
        let mut rng = StdRng::seed_from_u64(9);

        let actions = rt.fire_immediate(&cfg, &c, &mut rng);
        assert!(actions.is_empty());
        assert_eq!(rt.step_cursor(), 0);
    }

    #[test]
    fn fixed_step_out_of_range_salvages_by_default() {
        let mut cfg = base_config(1);
        cfg.steps = vec![StepDescriptor::Fixed(5)];
        let mut rt = PatternRuntime::new(1);
        let c = chord(&[60, 64]);
        let mut rng = StdRng::seed_from_u64(13);

        let actions = rt.fire_immediate(&cfg, &c, &mut rng);
        assert_eq!(actions.len(), 1, "out-of-range Fixed step should salvage, not go silent");
    }

    #[test]
    fn fixed_step_out_of_range_is_silent_when_toggled() {
        let mut cfg = base_config(1);
        cfg.steps = vec![StepDescriptor::Fixed(5)];
        cfg.silent_on_out_of_range = true;
        let mut rt = PatternRuntime::new(1);
        let c = chord(&[60, 64]);
        let mut rng = StdRng::seed_from_u64(14);

        let actions = rt.fire_immediate(&cfg, &c, &mut rng);
        assert!(actions.is_empty());
        assert_eq!(rt.step_cursor(), 0);
    }

    #[test]
    fn force_release_clears_sounding_and_pending() {
        let cfg = base_config(2);
        let mut rt = PatternRuntime::new(2);
        let c = chord(&[60, 64]);
        let mut rng = StdRng::seed_from_u64(11);
        rt.fire_immediate(&cfg, &c, &mut rng);
        assert!(rt.has_sounding_note());
        let actions = rt.force_release();
        assert_eq!(actions, vec![MidiAction::NoteOff { note: 60 }]);
        assert!(!rt.has_sounding_note());
        assert!(!rt.has_pending_off());
    }
}
