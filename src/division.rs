//! Division Resolver — converts a textual rhythmic division into a pulse
//! count per step, at 24 PPQN.
//!
//! Pure function, no state. Mirrors `original_source/midi_router.py`'s
//! `parse_division`, extended with a `q` (quintuplet) suffix the Python
//! source never had (see DESIGN.md).

/// Resolve a division string (e.g. `"1/16"`, `"1/8d"`, `"1/4t"`, `"1/8q"`)
/// into pulses-per-step at 24 PPQN. Never panics; unknown input resolves to
/// the 1/16 default. Result is always `>= 1.0`.
pub fn resolve_division(division: &str) -> f64 {
    let s = division.trim().to_ascii_lowercase();

    let (base_str, multiplier) = if let Some(stripped) = s.strip_suffix('d') {
        (stripped, 1.5)
    } else if let Some(stripped) = s.strip_suffix('t') {
        (stripped, 2.0 / 3.0)
    } else if let Some(stripped) = s.strip_suffix('q') {
        (stripped, 4.0 / 5.0)
    } else {
        (s.as_str(), 1.0)
    };

    let base = match base_str {
        "1" => 96.0,
        "1/2" => 48.0,
        "1/4" => 24.0,
        "1/8" => 12.0,
        "1/16" => 6.0,
        "1/32" => 3.0,
        _ => 6.0,
    };

    (base * multiplier).max(1.0)
}
