//! # Musical Tuning Module
//!
//! Pure conversions between frequencies, MIDI note numbers, note names and
//! cent offsets, based on twelve-tone equal temperament with A4 = 440 Hz.
//!
//! ## Features
//! - Full MIDI note range (C-1 to G9)
//! - Frequency to note/cents conversion for the note tracker
//! - Note names for display
//! - Octave shifting with clamping to the MIDI range

use once_cell::sync::Lazy;

/// MIDI note number of the reference pitch A4.
pub const A4_NOTE: u8 = 69;
/// Frequency of the reference pitch A4 in Hz.
pub const A4_FREQUENCY: f32 = 440.0;
/// Highest valid MIDI note number.
pub const MAX_NOTE: u8 = 127;

/// Display names for the whole MIDI range (0 to 127), sharps only.
///
/// Note 60 is "C4" and note 69 is "A4". The table is built once on first use.
static NOTE_NAMES: Lazy<Vec<String>> = Lazy::new(|| {
    const PITCH_CLASSES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    (0..=MAX_NOTE as usize)
        .map(|n| format!("{}{}", PITCH_CLASSES[n % 12], n as i32 / 12 - 1))
        .collect()
});

/// Converts a frequency to its exact (fractional) MIDI note value.
///
/// `69.0` is A4; each semitone adds one. The result is not rounded or
/// clamped.
pub fn frequency_to_midi(freq: f32) -> f32 {
    A4_NOTE as f32 + 12.0 * (freq / A4_FREQUENCY).log2()
}

/// Converts a frequency to the nearest MIDI note and its cents offset.
///
/// The note is `round(69 + 12*log2(f/440))` clamped to `0..=127`, the cents
/// offset is the rounded distance of the exact value from that note in
/// hundredths of a semitone (negative = flat, positive = sharp).
///
/// # Arguments
/// * `freq` - Input frequency in Hz
///
/// # Returns
/// * `Some((note, cents))` - Nearest note and its offset
/// * `None` - The frequency is zero, negative or not finite
pub fn frequency_to_note(freq: f32) -> Option<(u8, i32)> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let exact = frequency_to_midi(freq);
    let note = exact.round().clamp(0.0, MAX_NOTE as f32);
    // Out-of-range pitches pin to the edge note; keep their offset bounded.
    let cents = (((exact - note) * 100.0).round() as i32).clamp(-50, 50);
    Some((note as u8, cents))
}

/// Returns the display name of a MIDI note, e.g. "C4" for 60.
pub fn note_name(note: u8) -> &'static str {
    &NOTE_NAMES[note.min(MAX_NOTE) as usize]
}

/// Transposes a note by whole octaves, clamping to the MIDI range.
pub fn shift_octaves(note: u8, octaves: i8) -> u8 {
    (note as i32 + 12 * octaves as i32).clamp(0, MAX_NOTE as i32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a4_maps_to_note_69_with_zero_cents() {
        assert_eq!(frequency_to_note(440.0), Some((69, 0)));
        assert_eq!(frequency_to_midi(880.0), 81.0);
    }

    #[test]
    fn names_use_sharps_and_scientific_octaves() {
        assert_eq!(frequency_to_note(261.63), Some((60, 0)));
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(69), "A4");
        assert_eq!(note_name(61), "C#4");
        assert_eq!(note_name(0), "C-1");
        assert_eq!(note_name(127), "G9");
        assert_eq!(note_name(200), "G9");
    }

    #[test]
    fn sharp_and_flat_offsets_have_the_right_sign() {
        let (note, cents) = frequency_to_note(442.0).unwrap();
        assert_eq!(note, 69);
        assert_eq!(cents, 8);

        let (note, cents) = frequency_to_note(436.0).unwrap();
        assert_eq!(note, 69);
        assert_eq!(cents, -16);
    }

    #[test]
    fn cents_stay_within_half_a_semitone() {
        let mut freq = 30.0;
        while freq < 4000.0 {
            let (_, cents) = frequency_to_note(freq).unwrap();
            assert!((-50..=50).contains(&cents), "{freq} Hz gave {cents} cents");
            freq *= 1.013;
        }
    }

    #[test]
    fn invalid_frequencies_have_no_note() {
        assert_eq!(frequency_to_note(0.0), None);
        assert_eq!(frequency_to_note(-12.0), None);
        assert_eq!(frequency_to_note(f32::NAN), None);
        assert_eq!(frequency_to_note(f32::INFINITY), None);
    }

    #[test]
    fn extreme_frequencies_clamp_to_the_midi_range() {
        assert_eq!(frequency_to_note(1.0).unwrap().0, 0);
        assert_eq!(frequency_to_note(40_000.0).unwrap().0, 127);
    }

    #[test]
    fn octave_shift_clamps() {
        for shift in -3..=3 {
            assert_eq!(shift_octaves(60, shift), (60 + 12 * shift as i32) as u8);
        }
        assert_eq!(shift_octaves(120, 3), 127);
        assert_eq!(shift_octaves(5, -3), 0);
    }
}
