use std::fmt;
use uuid::Uuid;

/// Token identifying this client run on the shared broker.
///
/// Generated once at startup and used both as the `client_id` of every request
/// and as the suffix of the private response channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientIdentity {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the response channel private to `identity`.
pub fn channel_for(prefix: &str, identity: &ClientIdentity) -> String {
    format!("{}{}", prefix, identity.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_for() {
        let identity = ClientIdentity::from("abc");
        assert_eq!(
            channel_for("yolo/detect/response/", &identity),
            "yolo/detect/response/abc"
        );
    }

    #[test]
    fn test_generated_identities_are_distinct() {
        let a = ClientIdentity::generate();
        let b = ClientIdentity::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }
}
