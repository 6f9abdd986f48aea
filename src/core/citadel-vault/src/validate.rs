//! Input validation: master-password strength, secret key syntax.

use crate::error::VaultError;

/// Minimum master password length.
pub const MIN_PASSWORD_LENGTH: usize = 12;

/// Minimum export password length. Export bundles travel, so they get a
/// lower floor than the master password rather than the full rule set.
pub const MIN_EXPORT_PASSWORD_LENGTH: usize = 8;

/// Maximum secret key length.
pub const MAX_KEY_LENGTH: usize = 255;

const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?";

/// Password strength classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStrength {
    /// Fails the baseline rules.
    Weak,
    /// Meets the baseline with at most one violation.
    Medium,
    /// 16+ characters and every rule satisfied.
    Strong,
}

impl std::fmt::Display for PasswordStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Weak => "weak",
            Self::Medium => "medium",
            Self::Strong => "strong",
        };
        f.write_str(s)
    }
}

/// Result of a password strength check.
#[derive(Debug, Clone)]
pub struct PasswordReport {
    /// True when no rule was violated.
    pub valid: bool,
    /// Human-readable rule violations.
    pub errors: Vec<String>,
    /// Strength classification.
    pub strength: PasswordStrength,
}

/// Checks a master password against the strength rules.
///
/// Rules: at least [`MIN_PASSWORD_LENGTH`] characters, with an uppercase
/// letter, a lowercase letter, a digit, and a special character.
pub fn validate_password(password: &str) -> PasswordReport {
    let mut errors = Vec::new();

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        errors.push(format!(
            "must be at least {MIN_PASSWORD_LENGTH} characters long"
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push("must contain a digit".to_string());
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        errors.push("must contain a special character".to_string());
    }

    let length = password.chars().count();
    let strength = if length >= 16 && errors.is_empty() {
        PasswordStrength::Strong
    } else if length >= MIN_PASSWORD_LENGTH && errors.len() <= 1 {
        PasswordStrength::Medium
    } else {
        PasswordStrength::Weak
    };

    PasswordReport {
        valid: errors.is_empty(),
        errors,
        strength,
    }
}

/// Validates a master password, rejecting with the rule violations.
pub fn require_valid_password(password: &str) -> Result<(), VaultError> {
    let report = validate_password(password);
    if report.valid {
        Ok(())
    } else {
        Err(VaultError::InvalidPassword {
            errors: report.errors,
        })
    }
}

/// Validates an export password (length floor only).
pub fn require_valid_export_password(password: &str) -> Result<(), VaultError> {
    if password.chars().count() < MIN_EXPORT_PASSWORD_LENGTH {
        return Err(VaultError::InvalidPassword {
            errors: vec![format!(
                "export password must be at least {MIN_EXPORT_PASSWORD_LENGTH} characters long"
            )],
        });
    }
    Ok(())
}

/// Validates secret key syntax: `^[A-Z][A-Z0-9_]*$`, at most
/// [`MAX_KEY_LENGTH`] characters.
pub fn validate_secret_key(key: &str) -> Result<(), VaultError> {
    if key.is_empty() {
        return Err(VaultError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(VaultError::InvalidKey(format!(
            "key too long (max {MAX_KEY_LENGTH} characters)"
        )));
    }

    let mut chars = key.chars();
    let first = chars.next().expect("non-empty");
    if !first.is_ascii_uppercase() {
        return Err(VaultError::InvalidKey(
            "key must start with an uppercase letter".to_string(),
        ));
    }
    if !chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
        return Err(VaultError::InvalidKey(
            "key may only contain A-Z, 0-9, and underscore".to_string(),
        ));
    }

    Ok(())
}
