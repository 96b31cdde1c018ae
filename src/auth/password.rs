//! Shared secret for the control channel

use std::fmt;

/// The single secret every monitor client must present
#[derive(Clone, PartialEq, Eq)]
pub struct Password {
    secret: String,
}

impl Password {
    /// Returns `None` for an empty secret, which means no auth is required
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            None
        } else {
            Some(Self { secret })
        }
    }

    /// Compare without stopping at the first differing byte
    pub fn matches(&self, candidate: &str) -> bool {
        let (given, expected) = (candidate.as_bytes(), self.secret.as_bytes());
        given.len() == expected.len()
            && given
                .iter()
                .zip(expected)
                .fold(0u8, |diff, (a, b)| diff | (a ^ b))
                == 0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_matches() {
        let password = Password::new("secret").unwrap();
        assert!(password.matches("secret"));
        assert!(!password.matches("wrong"));
        assert!(!password.matches("secreT"));
        assert!(!password.matches("secret-extra"));
        assert!(!password.matches(""));
    }

    #[test]
    fn test_empty_password_disables_auth() {
        assert!(Password::new("").is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let password = Password::new("hunter2").unwrap();
        assert_eq!(format!("{:?}", password), "Password([REDACTED])");
    }
}
