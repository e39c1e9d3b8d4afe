//! Serde glue for the [`SecretString`] credentials in a config document.
//!
//! Documents stay plain JSON so NVS and the host config file can round-trip
//! them; redaction comes from `SecretString`'s own `Debug`.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serializer};

pub fn empty() -> SecretString {
    SecretString::from(String::new())
}

pub fn is_set(secret: &SecretString) -> bool {
    !secret.expose_secret().is_empty()
}

pub fn serialize<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Credential {
        #[serde(with = "super", default = "super::empty")]
        pass: SecretString,
    }

    #[test]
    fn debug_output_hides_value() {
        let credential = Credential {
            pass: SecretString::from("Sl123456"),
        };

        assert!(!format!("{:?}", credential.pass).contains("Sl123456"));
        assert_eq!(credential.pass.expose_secret(), "Sl123456");
    }

    #[test]
    fn serializes_as_plain_string() {
        let credential = Credential {
            pass: SecretString::from("p@ss=word;"),
        };
        let json = serde_json::to_string(&credential).unwrap();
        let loaded: Credential = serde_json::from_str(&json).unwrap();

        assert_eq!(json, r#"{"pass":"p@ss=word;"}"#);
        assert_eq!(loaded.pass.expose_secret(), "p@ss=word;");
    }

    #[test]
    fn missing_value_is_unset() {
        let loaded: Credential = serde_json::from_str("{}").unwrap();

        assert!(!is_set(&loaded.pass));
        assert!(is_set(&SecretString::from("x")));
    }
}
