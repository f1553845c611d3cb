/// Short deterministic fingerprint of a secret, safe to use as a public
/// handle (logs, diagnostics, admin listings). Never reversible, never
/// serialized alongside the secret it was derived from.
pub fn fingerprint(secret: &str) -> String {
    let hash = blake3::hash(secret.as_bytes());
    hash.to_hex()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_deterministic_and_short() {
        let a = fingerprint("sk-abc123");
        let b = fingerprint("sk-abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn differs_for_different_secrets() {
        assert_ne!(fingerprint("sk-one"), fingerprint("sk-two"));
    }
}
