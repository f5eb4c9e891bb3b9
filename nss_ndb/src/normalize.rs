//! Windows-style name decorations.
//!
//! Names arriving from Samba or Kerberos aware callers may carry a
//! `WORKGROUP\` prefix or an `@REALM` suffix. When configured, the matching
//! decoration is removed before the name is used as a key. `None` leaves the
//! name alone; an empty configured string matches any decoration.

/// Strips a leading `WORKGROUP\`.
///
/// Only the first backslash counts. An empty prefix (`\alice`) is always
/// removed once stripping is enabled.
pub fn strip_workgroup<'n>(name: &'n [u8], workgroup: Option<&str>) -> &'n [u8] {
    let Some(workgroup) = workgroup else {
        return name;
    };
    match name.iter().position(|b| *b == b'\\') {
        Some(at) if decoration_matches(&name[..at], workgroup) => &name[at + 1..],
        _ => name,
    }
}

/// Strips a trailing `@REALM`, splitting at the last `@`.
pub fn strip_realm<'n>(name: &'n [u8], realm: Option<&str>) -> &'n [u8] {
    let Some(realm) = realm else {
        return name;
    };
    match name.iter().rposition(|b| *b == b'@') {
        Some(at) if decoration_matches(&name[at + 1..], realm) => &name[..at],
        _ => name,
    }
}

pub fn normalize<'n>(name: &'n [u8], workgroup: Option<&str>, realm: Option<&str>) -> &'n [u8] {
    strip_realm(strip_workgroup(name, workgroup), realm)
}

fn decoration_matches(found: &[u8], configured: &str) -> bool {
    configured.is_empty() || found.is_empty() || found.eq_ignore_ascii_case(configured.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_leaves_names_alone() {
        assert_eq!(normalize(b"CORP\\alice@EXAMPLE.COM", None, None), b"CORP\\alice@EXAMPLE.COM");
    }

    #[test]
    fn workgroup_matches_case_insensitively() {
        assert_eq!(strip_workgroup(b"CORP\\alice", Some("corp")), b"alice");
        assert_eq!(strip_workgroup(b"OTHER\\alice", Some("corp")), b"OTHER\\alice");
        assert_eq!(strip_workgroup(b"alice", Some("corp")), b"alice");
    }

    #[test]
    fn empty_workgroup_strips_any_prefix() {
        assert_eq!(strip_workgroup(b"ANY\\alice", Some("")), b"alice");
        assert_eq!(strip_workgroup(b"\\alice", Some("corp")), b"alice");
    }

    #[test]
    fn only_the_first_backslash_separates() {
        assert_eq!(strip_workgroup(b"CORP\\a\\b", Some("corp")), b"a\\b");
    }

    #[test]
    fn realm_splits_at_the_last_at_sign() {
        assert_eq!(strip_realm(b"alice@EXAMPLE.COM", Some("example.com")), b"alice");
        assert_eq!(strip_realm(b"a@b@EXAMPLE.COM", Some("example.com")), b"a@b");
        assert_eq!(strip_realm(b"alice@OTHER.ORG", Some("example.com")), b"alice@OTHER.ORG");
        assert_eq!(strip_realm(b"alice@ANYWHERE", Some("")), b"alice");
    }

    #[test]
    fn both_decorations_come_off() {
        assert_eq!(normalize(b"CORP\\alice@EXAMPLE.COM", Some("CORP"), Some("EXAMPLE.COM")), b"alice");
        assert_eq!(normalize(b"CORP\\", Some("CORP"), None), b"");
    }
}
