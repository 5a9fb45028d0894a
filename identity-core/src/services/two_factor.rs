//! Short-lived numeric second-factor codes.

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng};
use subtle::ConstantTimeEq;

use crate::models::TwoFactorChallenge;

pub const CODE_LENGTH: usize = 6;
pub const CODE_EXPIRY_SECONDS: i64 = 300;

/// Six zero-padded ASCII digits from the OS CSPRNG.
pub fn generate_code() -> String {
    let value: u32 = OsRng.gen_range(0..1_000_000);
    format!("{:0width$}", value, width = CODE_LENGTH)
}

/// Fresh challenge valid for [`CODE_EXPIRY_SECONDS`] from `now`.
pub fn new_challenge(now: DateTime<Utc>) -> TwoFactorChallenge {
    TwoFactorChallenge {
        code: generate_code(),
        generated_at: now,
        expires_at: now + Duration::seconds(CODE_EXPIRY_SECONDS),
    }
}

/// Rejects empty input and absent or elapsed expiry before comparing.
///
/// The comparison itself is constant time over the code bytes.
pub fn validate_code(
    stored: &str,
    provided: &str,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if stored.is_empty() || provided.is_empty() {
        return false;
    }

    match expires_at {
        Some(expiry) if expiry > now => {}
        _ => return false,
    }

    stored.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Checks a provided code against a principal's stored challenge.
pub fn validate_challenge(
    challenge: Option<&TwoFactorChallenge>,
    provided: &str,
    now: DateTime<Utc>,
) -> bool {
    match challenge {
        Some(c) => validate_code(&c.code, provided, Some(c.expires_at), now),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn matching_code_within_window_is_valid() {
        let now = Utc::now();
        let challenge = new_challenge(now);
        assert!(validate_code(
            &challenge.code,
            &challenge.code,
            Some(challenge.expires_at),
            now + Duration::seconds(299)
        ));
    }

    #[test]
    fn expired_code_is_rejected_even_if_digits_match() {
        let now = Utc::now();
        let challenge = new_challenge(now);

        assert!(!validate_code(
            &challenge.code,
            &challenge.code,
            Some(challenge.expires_at),
            now + Duration::seconds(CODE_EXPIRY_SECONDS)
        ));
        assert!(!validate_code(
            &challenge.code,
            &challenge.code,
            Some(challenge.expires_at),
            now + Duration::minutes(6)
        ));
    }

    #[test]
    fn empty_or_missing_inputs_are_rejected() {
        let now = Utc::now();
        let later = Some(now + Duration::minutes(1));

        assert!(!validate_code("", "", later, now));
        assert!(!validate_code("123456", "", later, now));
        assert!(!validate_code("", "123456", later, now));
        assert!(!validate_code("123456", "123456", None, now));
    }

    #[test]
    fn mismatched_codes_are_rejected() {
        let now = Utc::now();
        let later = Some(now + Duration::minutes(1));

        assert!(!validate_code("123456", "123457", later, now));
        assert!(!validate_code("123456", "12345", later, now));
    }

    #[test]
    fn missing_challenge_never_validates() {
        assert!(!validate_challenge(None, "123456", Utc::now()));
    }
}
