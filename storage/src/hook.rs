use catalog_core::{PrivateRepoGate, Repo, StoreError, StoreResult};

/// License-derived quota on private repositories.
///
/// Invoked by the store before committing a repository that is, or is
/// becoming, private. Only the transition *into* private counts against the
/// cap: staying private, going public, or an unrestricted license always
/// pass.
#[derive(Debug, Clone, Copy)]
pub struct LicenseGate {
    /// `None` means the license is unrestricted.
    max_private_repos: Option<u64>,
}

impl LicenseGate {
    pub fn new(max_private_repos: Option<u64>) -> Self {
        Self { max_private_repos }
    }

    pub fn unrestricted() -> Self {
        Self {
            max_private_repos: None,
        }
    }
}

impl PrivateRepoGate for LicenseGate {
    fn check(&self, current_private: u64, repo: &Repo, was_private: bool) -> StoreResult<()> {
        let Some(max) = self.max_private_repos else {
            return Ok(());
        };

        if !repo.private || was_private {
            return Ok(());
        }

        if current_private >= max {
            return Err(StoreError::PrivateRepoLimit {
                name: repo.name.clone(),
                max,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_repo(name: &str) -> Repo {
        Repo {
            name: name.to_string(),
            private: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_transition_into_private_over_cap_fails() {
        let gate = LicenseGate::new(Some(1));
        let err = gate.check(1, &private_repo("a/b"), false).unwrap_err();
        assert!(err.is_quota_violation());
    }

    #[test]
    fn test_transition_into_private_under_cap_passes() {
        let gate = LicenseGate::new(Some(2));
        assert!(gate.check(1, &private_repo("a/b"), false).is_ok());
    }

    #[test]
    fn test_staying_private_over_cap_passes() {
        let gate = LicenseGate::new(Some(1));
        assert!(gate.check(1, &private_repo("a/b"), true).is_ok());
    }

    #[test]
    fn test_public_repo_always_passes() {
        let gate = LicenseGate::new(Some(0));
        let repo = Repo {
            name: "a/b".to_string(),
            private: false,
            ..Default::default()
        };
        assert!(gate.check(99, &repo, false).is_ok());
    }

    #[test]
    fn test_unrestricted_license_passes() {
        let gate = LicenseGate::unrestricted();
        assert!(gate.check(u64::MAX, &private_repo("a/b"), false).is_ok());
    }
}
