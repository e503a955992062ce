//! Phone number normalization.
//!
//! Raw phone text from the API comes in every shape a human can type. The
//! canonical form is E.164 (`+7XXXXXXXXXX`) and is the deduplication key.

use phonenumber::country::Id;
use phonenumber::Mode;

/// Region whose numbering plan decides validity.
const REGION: Id = Id::RU;

/// Domestic trunk prefix used in 11-digit numbers (`8 916 ...`).
const TRUNK_DIGIT: char = '8';

/// Country calling code digit replacing the trunk prefix (`7 916 ...`).
const COUNTRY_DIGIT: char = '7';

const DOMESTIC_LENGTH: usize = 11;

/// Stateless normalizer; safe to use from any number of tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhoneNormalizer;

impl PhoneNormalizer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns the canonical E.164 form, or `None` when the text is not a
    /// valid number of the region. Rejections are not errors; callers skip them.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> Option<String> {
        normalize(raw)
    }
}

/// See [`PhoneNormalizer::normalize`].
#[must_use]
pub fn normalize(raw: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    if digits.len() == DOMESTIC_LENGTH && digits.starts_with(TRUNK_DIGIT) {
        digits.replace_range(..1, "7");
    }

    if digits.starts_with(COUNTRY_DIGIT) {
        digits.insert(0, '+');
    }

    let number = phonenumber::parse(Some(REGION), &digits).ok()?;
    if !phonenumber::is_valid(&number) {
        return None;
    }

    let canonical = number.format().mode(Mode::E164).to_string();
    // Numbers dialled through the international prefix can resolve to other
    // countries; only the region's own numbers are canonical.
    canonical
        .strip_prefix('+')
        .is_some_and(|rest| rest.starts_with(COUNTRY_DIGIT))
        .then_some(canonical)
}
