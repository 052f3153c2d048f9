//! Ringtone and notification side effects
//!
//! Thin, stateless hooks the core fires on session-state transitions. The
//! host wires them to actual audio output and system notifications; the
//! provided [`NullAlerts`] ignores everything.

/// Sink for sound and notification side effects
pub trait AlertSink: Send + Sync {
    /// Start looping the ringtone for an incoming call
    fn ring_start(&self);

    /// Stop the ringtone
    fn ring_stop(&self);

    /// Post a system notification for an incoming call
    fn notify_incoming(&self, remote_number: &str);

    /// Play a short feedback tone (DTMF key click)
    fn play_tone(&self, samples: &[i16]);
}

/// No-op sink
pub struct NullAlerts;

impl AlertSink for NullAlerts {
    fn ring_start(&self) {}
    fn ring_stop(&self) {}
    fn notify_incoming(&self, _remote_number: &str) {}
    fn play_tone(&self, _samples: &[i16]) {}
}

/// Generate the dual-frequency feedback tone for a DTMF key press.
///
/// 80ms of audio at the given sample rate; unknown keys produce silence so a
/// bad digit never turns into a screech.
pub fn dtmf_feedback_tone(digit: char, sample_rate: u32) -> Vec<i16> {
    let num_samples = (sample_rate as usize * 80) / 1000;

    let (low_freq, high_freq) = match digit {
        '1' => (697.0, 1209.0),
        '2' => (697.0, 1336.0),
        '3' => (697.0, 1477.0),
        '4' => (770.0, 1209.0),
        '5' => (770.0, 1336.0),
        '6' => (770.0, 1477.0),
        '7' => (852.0, 1209.0),
        '8' => (852.0, 1336.0),
        '9' => (852.0, 1477.0),
        '*' => (941.0, 1209.0),
        '0' => (941.0, 1336.0),
        '#' => (941.0, 1477.0),
        'A' => (697.0, 1633.0),
        'B' => (770.0, 1633.0),
        'C' => (852.0, 1633.0),
        'D' => (941.0, 1633.0),
        _ => return vec![0i16; num_samples],
    };

    let amplitude = 8000.0;
    (0..num_samples)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            let low = (2.0 * std::f64::consts::PI * low_freq * t).sin();
            let high = (2.0 * std::f64::consts::PI * high_freq * t).sin();
            ((low + high) * amplitude / 2.0) as i16
        })
        .collect()
}

/// True when `digit` is a valid DTMF key
pub(crate) fn is_dtmf_digit(digit: char) -> bool {
    matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D')
}
