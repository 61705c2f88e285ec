//! Credential masking for anything echoed back to callers

/// Number of characters revealed at each end of a masked credential
pub const REVEAL_CHARS: usize = 4;

/// Mask a credential as `first4...last4`.
///
/// Credentials of 8 characters or fewer are returned unmasked.
pub fn mask_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= REVEAL_CHARS * 2 {
        return credential.to_string();
    }

    let head: String = chars[..REVEAL_CHARS].iter().collect();
    let tail: String = chars[chars.len() - REVEAL_CHARS..].iter().collect();
    format!("{}...{}", head, tail)
}
