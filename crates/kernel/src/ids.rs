//! Public identifier helpers.
//!
//! Rows carry a UUID primary key internally and a short opaque token for
//! external use. Resolvers accept either form.

use rand::Rng;
use rand::distributions::Alphanumeric;
use uuid::Uuid;

/// Length of generated public identifiers.
const PUBLIC_ID_LEN: usize = 12;

/// Generate a short opaque public identifier.
pub fn public_id() -> String {
    let rng = rand::thread_rng();
    rng.sample_iter(Alphanumeric)
        .take(PUBLIC_ID_LEN)
        .map(char::from)
        .collect()
}

/// Try to interpret an external key as an internal UUID.
pub fn as_uuid(key: &str) -> Option<Uuid> {
    Uuid::parse_str(key).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn public_ids_are_short_and_alphanumeric() {
        let id = public_id();
        assert_eq!(id.len(), PUBLIC_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn uuid_keys_resolve() {
        let u = Uuid::now_v7();
        assert_eq!(as_uuid(&u.to_string()), Some(u));
        assert_eq!(as_uuid("not-a-uuid"), None);
    }
}
