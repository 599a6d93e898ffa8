use crate::secret::SecretString;

/// Operator-facing hint for a secret: first and last character around `****`.
pub fn preview(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 2 {
        return "****".to_string();
    }
    format!("{}****{}", chars[0], chars[chars.len() - 1])
}

pub fn preview_secret(secret: &SecretString) -> String {
    preview(secret.expose())
}

/// Strips a known secret out of engine diagnostics before they are logged or
/// returned inside an error.
pub fn scrub(text: &str, secrets: &[&SecretString]) -> String {
    let mut scrubbed = text.to_string();
    for secret in secrets {
        let raw = secret.expose();
        if raw.len() > 2 {
            scrubbed = scrubbed.replace(raw, &preview(raw));
        }
    }
    scrubbed
}
