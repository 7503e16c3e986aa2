/// Time signature as reported by the host transport.
///
/// Carries a validity flag: before the transport has published BBT fields the
/// signature is a placeholder and scripts should not trust it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSignature {
    valid: bool,
    numerator: f32,
    denominator: f32,
}

impl TimeSignature {
    pub fn new(valid: bool, numerator: f32, denominator: f32) -> Self {
        Self {
            valid,
            numerator,
            denominator,
        }
    }

    /// Whether the host had published valid BBT fields when this was read.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Beats per bar.
    pub fn numerator(&self) -> f32 {
        self.numerator
    }

    /// Note value that gets one beat.
    pub fn denominator(&self) -> f32 {
        self.denominator
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(false, 4.0, 4.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_invalid_four_four() {
        let ts = TimeSignature::default();
        assert!(!ts.is_valid());
        assert_eq!(ts.numerator(), 4.0);
        assert_eq!(ts.denominator(), 4.0);
    }
}
