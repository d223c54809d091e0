//! Config Loader — reads the JSON config document from disk and turns it
//! into validated, run-ready [`PatternConfig`]s.
//!
//! Grounded in `original_source/midi_router.py`'s `load_config`: the
//! `//`-comment stripping pre-pass, the per-field defaulting/clamping
//! rules, and the `default_pattern` ascending/descending fallback are all
//! carried over from there rather than invented; `config_editor.py`
//! is the source for the richer per-step fields (`s-prob`, `s-oct`,
//! `r-oct`, `gate`) that the router script itself never reads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::division::resolve_division;
use crate::error::ConfigError;
use crate::model::{GateEntry, PatternConfig, RandOctave, StepDescriptor, VelocityEntry};

/// Top-level JSON document shape.
#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default = "default_input_channel")]
    input_channel: i64,
    #[serde(default)]
    output_channels: BTreeMap<String, i64>,
    #[serde(default)]
    patterns: BTreeMap<String, RawPatternConfig>,
}

fn default_input_channel() -> i64 {
    1
}

/// One pattern's raw JSON fields, all optional — every field is defaulted
/// or padded the same way `original_source/midi_router.py` does before a
/// pattern becomes runnable.
#[derive(Debug, Default, Deserialize)]
struct RawPatternConfig {
    length: Option<i64>,
    steps: Option<Vec<Value>>,
    #[serde(rename = "oktawa")]
    octave: Option<i64>,
    velocity: Option<Vec<Value>>,
    #[serde(rename = "v-random")]
    v_random: Option<Vec<Value>>,
    #[serde(rename = "s-prob")]
    s_prob: Option<Vec<Value>>,
    #[serde(rename = "s-oct")]
    s_oct: Option<Vec<Value>>,
    #[serde(rename = "r-oct")]
    r_oct: Option<Vec<Value>>,
    gate: Option<Vec<Value>>,
    division: Option<String>,
    enabled: Option<bool>,
    #[serde(rename = "silent-on-out-of-range")]
    silent_on_out_of_range: Option<bool>,
}

/// Read and validate the config file at `path`, returning the resolved
/// input channel (0-indexed) and the pattern set in the document's
/// declaration order (`output_channels` insertion order — a `BTreeMap`
/// alone would silently re-sort this to lexical order, which the
/// coordinator's "stable iteration order" guarantee must not depend on).
pub fn load(path: &Path) -> Result<(u8, Vec<PatternConfig>), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let stripped = strip_line_comments(&raw);
    let root: Value = serde_json::from_str(&stripped)?;
    let pattern_order = capture_pattern_order(&root);
    let doc: ConfigDocument = serde_json::from_value(root)?;

    if doc.output_channels.is_empty() {
        return Err(ConfigError::NoOutputChannels);
    }
    if !(1..=16).contains(&doc.input_channel) {
        return Err(ConfigError::InputChannelOutOfRange(doc.input_channel));
    }
    let input_channel = (doc.input_channel - 1) as u8;

    let mut patterns = Vec::with_capacity(doc.output_channels.len());
    for name in &pattern_order {
        let Some(&channel) = doc.output_channels.get(name) else {
            continue;
        };
        if !(1..=16).contains(&channel) {
            return Err(ConfigError::ChannelOutOfRange { pattern: name.clone(), channel });
        }
        let raw_pattern = doc.patterns.get(name).cloned_or_default();
        let resolved = resolve_pattern(name, raw_pattern, (channel - 1) as u8)?;
        patterns.push(resolved);
    }

    Ok((input_channel, patterns))
}

/// Strip `//` line comments the way the Python original does: everything
/// after `//` is dropped unless an odd number of `"` precede it on that
/// line (i.e. the `//` sits inside a string literal, such as a URL).
fn strip_line_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for line in raw.lines() {
        if let Some(idx) = line.find("//") {
            let before = &line[..idx];
            if before.matches('"').count() % 2 == 0 {
                out.push_str(before);
            } else {
                out.push_str(line);
            }
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// `output_channels` document order, read straight from the raw JSON
/// value before it collapses into a `BTreeMap`.
fn capture_pattern_order(root: &Value) -> Vec<String> {
    root.get("output_channels")
        .and_then(Value::as_object)
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

/// Ascending (1..=8) for a name containing `"1"`, descending (8..=1)
/// otherwise — the exact fallback `default_pattern()` applies in the
/// Python original when a pattern has no usable `steps`.
fn default_steps(name: &str) -> Vec<u8> {
    if name.contains('1') {
        (1..=8).collect()
    } else {
        (1..=8).rev().collect()
    }
}

fn resolve_pattern(
    name: &str,
    raw: RawPatternConfig,
    output_channel: u8,
) -> Result<PatternConfig, ConfigError> {
    let mut steps_numbers: Vec<StepDescriptor> = raw
        .steps
        .as_deref()
        .map(|v| v.iter().take(16).map(parse_step).collect())
        .unwrap_or_default();

    let mut length = raw.length.unwrap_or(steps_numbers.len() as i64);
    if steps_numbers.is_empty() {
        let fallback = default_steps(name);
        length = fallback.len() as i64;
        steps_numbers = fallback.into_iter().map(StepDescriptor::Fixed).collect();
    }
    let length = length.clamp(1, 16) as usize;
    if length == 0 {
        return Err(ConfigError::LengthOutOfRange(name.to_string(), 0));
    }
    pad_or_truncate(&mut steps_numbers, length, StepDescriptor::Fixed(1));

    let mut velocity: Vec<VelocityEntry> = raw
        .velocity
        .as_deref()
        .map(|v| v.iter().take(length).map(parse_velocity).collect())
        .unwrap_or_default();
    pad_or_truncate(&mut velocity, length, VelocityEntry::Fixed(100));

    let mut v_random: Vec<u8> = raw
        .v_random
        .as_deref()
        .map(|v| v.iter().take(length).map(|x| parse_clamped_u8(x, 0, 100, 0)).collect())
        .unwrap_or_default();
    pad_or_truncate(&mut v_random, length, 0);

    let mut s_prob: Vec<u8> = raw
        .s_prob
        .as_deref()
        .map(|v| v.iter().take(length).map(|x| parse_clamped_u8(x, 0, 100, 100)).collect())
        .unwrap_or_default();
    pad_or_truncate(&mut s_prob, length, 100);

    let mut s_oct: Vec<i8> = raw
        .s_oct
        .as_deref()
        .map(|v| v.iter().take(length).map(|x| parse_clamped_i8(x, -2, 2, 0)).collect())
        .unwrap_or_default();
    pad_or_truncate(&mut s_oct, length, 0);

    let mut r_oct: Vec<RandOctave> = raw
        .r_oct
        .as_deref()
        .map(|v| v.iter().take(length).map(parse_rand_octave).collect())
        .unwrap_or_default();
    pad_or_truncate(&mut r_oct, length, RandOctave::zero());

    let mut gate: Vec<GateEntry> = raw
        .gate
        .as_deref()
        .map(|v| v.iter().take(length).map(parse_gate).collect())
        .unwrap_or_default();
    pad_or_truncate(&mut gate, length, GateEntry::Percent(100));

    let global_octave = raw.octave.map(|o| o.clamp(-5, 5) as i8).unwrap_or(0);
    let division = raw.division.unwrap_or_else(|| "1/16".to_string());
    let pulses_per_step = resolve_division(&division);
    let enabled = raw.enabled.unwrap_or(true);
    let silent_on_out_of_range = raw.silent_on_out_of_range.unwrap_or(false);

    Ok(PatternConfig {
        name: name.to_string(),
        length,
        steps: steps_numbers,
        velocity,
        v_random,
        s_prob,
        s_oct,
        r_oct,
        gate,
        global_octave,
        division,
        pulses_per_step,
        enabled,
        output_channel,
        silent_on_out_of_range,
    })
}

fn pad_or_truncate<T: Clone>(v: &mut Vec<T>, length: usize, fill: T) {
    v.truncate(length);
    while v.len() < length {
        v.push(fill.clone());
    }
}

fn parse_step(v: &Value) -> StepDescriptor {
    match v {
        Value::String(s) => match s.to_ascii_uppercase().as_str() {
            "X" => StepDescriptor::Rest,
            "R" => StepDescriptor::Random,
            other => other
                .parse::<i64>()
                .map(|n| StepDescriptor::Fixed(n.clamp(1, 8) as u8))
                .unwrap_or(StepDescriptor::Rest),
        },
        Value::Number(n) => {
            let idx = n.as_i64().unwrap_or(1).clamp(1, 8);
            StepDescriptor::Fixed(idx as u8)
        }
        _ => StepDescriptor::Rest,
    }
}

fn parse_velocity(v: &Value) -> VelocityEntry {
    match v {
        Value::String(s) if s.eq_ignore_ascii_case("r") => VelocityEntry::Random,
        Value::String(s) => s
            .parse::<i64>()
            .map(|n| VelocityEntry::Fixed(n.clamp(1, 127) as u8))
            .unwrap_or(VelocityEntry::Fixed(100)),
        Value::Number(n) => {
            VelocityEntry::Fixed(n.as_i64().unwrap_or(100).clamp(1, 127) as u8)
        }
        _ => VelocityEntry::Fixed(100),
    }
}

fn parse_gate(v: &Value) -> GateEntry {
    match v {
        Value::String(s) if s.eq_ignore_ascii_case("tie") || s.eq_ignore_ascii_case("t") => {
            GateEntry::Tie
        }
        Value::String(s) => s
            .parse::<i64>()
            .map(|n| GateEntry::Percent(n.clamp(1, 100) as u8))
            .unwrap_or(GateEntry::Percent(100)),
        Value::Number(n) => GateEntry::Percent(n.as_i64().unwrap_or(100).clamp(1, 100) as u8),
        _ => GateEntry::Percent(100),
    }
}

/// Parses the `"0"|"+1"|"+2"|"-1"|"-2"|"+-1"|"+-2"` wire vocabulary.
/// `"+-k"` is the two-sided range `{-k..=k}`; a bare signed `"+k"`/`"-k"` is
/// the "single value ±k" form, which resolves uniformly to `{-k,+k}`
/// regardless of which sign was written — there is no separate "fixed,
/// one-sided" wire value for r-oct.
fn parse_rand_octave(v: &Value) -> RandOctave {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if s == "0" {
                return RandOctave::zero();
            }
            if let Some(k) = s.strip_prefix("+-") {
                let k = k.parse::<i64>().unwrap_or(0).clamp(0, 5) as i8;
                RandOctave::Range(k)
            } else if let Some(k) = s.strip_prefix('+').or_else(|| s.strip_prefix('-')) {
                let k = k.parse::<i64>().unwrap_or(0).clamp(0, 5) as i8;
                RandOctave::Bipolar(k)
            } else {
                let k = s.parse::<i64>().unwrap_or(0).clamp(-5, 5) as i8;
                RandOctave::Fixed(k)
            }
        }
        Value::Number(n) => {
            RandOctave::Fixed(n.as_i64().unwrap_or(0).clamp(-5, 5) as i8)
        }
        _ => RandOctave::zero(),
    }
}

fn parse_clamped_u8(v: &Value, lo: i64, hi: i64, default: u8) -> u8 {
    let n = match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    n.map(|n| n.clamp(lo, hi) as u8).unwrap_or(default)
}

fn parse_clamped_i8(v: &Value, lo: i64, hi: i64, default: i8) -> i8 {
    let n = match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    n.map(|n| n.clamp(lo, hi) as i8).unwrap_or(default)
}

/// Small helper trait so `resolve_pattern` can consume an owned
/// `RawPatternConfig` whether or not the document defined this pattern
/// by name, without an extra `Option` at every call site.
trait ClonedOrDefault {
    fn cloned_or_default(&self) -> RawPatternConfig;
}

impl ClonedOrDefault for Option<&RawPatternConfig> {
    fn cloned_or_default(&self) -> RawPatternConfig {
        match self {
            Some(r) => RawPatternConfig {
                length: r.length,
                steps: r.steps.clone(),
                octave: r.octave,
                velocity: r.velocity.clone(),
                v_random: r.v_random.clone(),
                s_prob: r.s_prob.clone(),
                s_oct: r.s_oct.clone(),
                r_oct: r.r_oct.clone(),
                gate: r.gate.clone(),
                division: r.division.clone(),
                enabled: r.enabled,
                silent_on_out_of_range: r.silent_on_out_of_range,
            },
            None => RawPatternConfig::default(),
        }
    }
}
