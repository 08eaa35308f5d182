/// Shared-token connection authentication. Per-call actor identity comes
/// from verified account ids once the connection is authenticated; session
/// issuance itself is a collaborator, not part of this service.
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: String) -> Self {
        Self { token }
    }

    pub fn verify(&self, presented: &str) -> bool {
        // Constant-time comparison: don't leak the match prefix length.
        if presented.len() != self.token.len() {
            return false;
        }
        presented
            .bytes()
            .zip(self.token.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_token() {
        let auth = TokenAuth::new("secret".into());
        assert!(auth.verify("secret"));
    }

    #[test]
    fn rejects_wrong_or_partial_token() {
        let auth = TokenAuth::new("secret".into());
        assert!(!auth.verify("secret1"));
        assert!(!auth.verify("secre"));
        assert!(!auth.verify(""));
    }
}
