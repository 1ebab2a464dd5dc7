//! Newtype wrappers for domain identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A repository identifier (`organization/repository`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Returns the `owner/repo` form used as the registry key and by webhook payloads.
    pub fn full_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Error returned when a full name is not of the form `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository full name: {0:?}")]
pub struct InvalidRepoId(pub String);

impl FromStr for RepoId {
    type Err = InvalidRepoId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, repo))
                if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
            {
                Ok(RepoId::new(owner, repo))
            }
            _ => Err(InvalidRepoId(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn display_parses_back(
            owner in "[a-zA-Z][a-zA-Z0-9-]{0,38}",
            repo in "[a-zA-Z][a-zA-Z0-9_.-]{0,99}"
        ) {
            let id = RepoId::new(&owner, &repo);
            let parsed: RepoId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }

    #[test]
    fn full_name_matches_display() {
        let id = RepoId::new("acme", "widgets");
        assert_eq!(id.full_name(), "acme/widgets");
    }

    #[test]
    fn rejects_malformed_full_names() {
        for bad in ["", "acme", "/widgets", "acme/", "acme/widgets/extra"] {
            assert!(bad.parse::<RepoId>().is_err(), "{bad:?} should not parse");
        }
    }
}
