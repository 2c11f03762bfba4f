//! Protocol version negotiation
//!
//! Client and server must agree on major.minor; the patch level is free to
//! drift. The version string rides in `Login` / `LoginResp`.

pub fn full() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Check whether a peer's version can talk to ours.
pub fn compat(peer: &str) -> bool {
    match (major_minor(peer), major_minor(full())) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_is_semver() {
        assert!(major_minor(full()).is_some());
    }

    #[test]
    fn test_same_version_compatible() {
        assert!(compat(full()));
    }

    #[test]
    fn test_patch_drift_compatible() {
        let (major, minor) = major_minor(full()).unwrap();
        assert!(compat(&format!("{}.{}.99", major, minor)));
    }

    #[test]
    fn test_minor_drift_incompatible() {
        let (major, minor) = major_minor(full()).unwrap();
        assert!(!compat(&format!("{}.{}.0", major, minor + 1)));
    }

    #[test]
    fn test_garbage_incompatible() {
        assert!(!compat("not-a-version"));
        assert!(!compat(""));
    }
}
