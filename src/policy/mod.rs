//! Declarative branch-protection policy.
//!
//! Each organization has one policy file, `<organization>.toml`, in the policy
//! directory. Every top-level table names a repository:
//!
//! ```toml
//! [widgets]
//! branches = ["^release/.*", "^main$"]
//! enable_push = "false"
//! required_approvals = 1
//! status_check_contexts = "['ci/build']"
//! ```
//!
//! `branches` holds the regex patterns (a TOML array, or a string containing a
//! literal list). Every other key is passed to the server as a protection
//! parameter after coercion (see [`coerce_parameter`]).

mod coerce;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::RepoId;

pub use coerce::{coerce_parameter, parse_literal};

/// Key holding the branch patterns in a repository table.
pub const BRANCHES_KEY: &str = "branches";

/// Extension of policy files.
pub const POLICY_EXTENSION: &str = "toml";

/// Protection parameters sent with every write, keyed by API field name.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Errors raised while loading a policy file.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("cannot read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("policy file name {0} has no usable organization stem")]
    BadFileName(PathBuf),

    #[error("repository {repo} has no `branches` key")]
    MissingBranches { repo: RepoId },

    #[error("repository {repo}: `branches` must be a list of strings")]
    InvalidBranches { repo: RepoId },

    #[error("repository {repo}: invalid branch pattern {pattern:?}: {source}")]
    InvalidPattern {
        repo: RepoId,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// The protection policy of a single repository.
#[derive(Debug, Clone)]
pub struct Policy {
    repo: RepoId,
    patterns: Vec<String>,
    compiled: Vec<Regex>,
    parameters: Parameters,
}

impl Policy {
    /// Builds a policy, compiling each pattern anchored at the start of the branch name.
    pub fn new(
        repo: RepoId,
        patterns: Vec<String>,
        parameters: Parameters,
    ) -> Result<Self, PolicyError> {
        let compiled = patterns
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})")).map_err(|source| {
                    PolicyError::InvalidPattern {
                        repo: repo.clone(),
                        pattern: pattern.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Policy {
            repo,
            patterns,
            compiled,
            parameters,
        })
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    /// The patterns as declared.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns true if any declared pattern matches the start of `branch`.
    pub fn matches(&self, branch: &str) -> bool {
        self.compiled.iter().any(|re| re.is_match(branch))
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// Lists the policy files of a directory, sorted by name.
pub fn discover_policy_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == POLICY_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Returns the organization a policy file describes (its file stem).
pub fn organization_of(path: &Path) -> Result<String, PolicyError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PolicyError::BadFileName(path.to_path_buf()))
}

/// Loads every repository policy declared in one organization file.
pub fn load_organization(path: &Path) -> Result<Vec<Policy>, PolicyError> {
    let organization = organization_of(path)?;
    let text = fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Table = text.parse().map_err(|source| PolicyError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut policies = Vec::new();
    for (name, value) in table {
        let toml::Value::Table(section) = value else {
            warn!(
                organization = %organization,
                key = %name,
                "Ignoring top-level key that is not a repository table"
            );
            continue;
        };
        let repo = RepoId::new(&organization, &name);
        let policy = policy_from_section(repo, section)?;
        debug!(
            repo = %policy.repo(),
            patterns = ?policy.patterns(),
            "Loaded repository policy"
        );
        policies.push(policy);
    }

    Ok(policies)
}

fn policy_from_section(repo: RepoId, section: toml::Table) -> Result<Policy, PolicyError> {
    let mut patterns = None;
    let mut parameters = Parameters::new();

    for (key, value) in section {
        if key == BRANCHES_KEY {
            patterns = Some(branch_patterns(&repo, value)?);
        } else {
            parameters.insert(key, coerce_parameter(value));
        }
    }

    let patterns = patterns.ok_or_else(|| PolicyError::MissingBranches { repo: repo.clone() })?;
    Policy::new(repo, patterns, parameters)
}

fn branch_patterns(repo: &RepoId, value: toml::Value) -> Result<Vec<String>, PolicyError> {
    let invalid = || PolicyError::InvalidBranches { repo: repo.clone() };

    let list = match value {
        toml::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s),
                _ => Err(invalid()),
            })
            .collect::<Result<Vec<_>, _>>()?,
        toml::Value::String(literal) => match parse_literal(&literal) {
            Some(serde_json::Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s),
                    _ => Err(invalid()),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(invalid()),
        },
        _ => return Err(invalid()),
    };

    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn policy(patterns: &[&str]) -> Policy {
        Policy::new(
            RepoId::new("acme", "widgets"),
            patterns.iter().map(|p| p.to_string()).collect(),
            Parameters::new(),
        )
        .unwrap()
    }

    #[test]
    fn matches_is_anchored_at_start() {
        let p = policy(&["release/.*"]);
        assert!(p.matches("release/1.0"));
        assert!(!p.matches("hotfix/release/1.0"));
    }

    #[test]
    fn matches_is_not_anchored_at_end() {
        let p = policy(&["main"]);
        assert!(p.matches("main"));
        assert!(p.matches("maintenance"));
        assert!(!policy(&["main$"]).matches("maintenance"));
    }

    #[test]
    fn alternation_stays_anchored() {
        let p = policy(&["a|b"]);
        assert!(p.matches("b-branch"));
        assert!(!p.matches("x-b"));
    }

    #[test]
    fn empty_pattern_list_matches_nothing() {
        assert!(!policy(&[]).matches("main"));
    }

    #[test]
    fn malformed_pattern_fails_at_load() {
        let err = Policy::new(
            RepoId::new("acme", "widgets"),
            vec!["release/(".to_string()],
            Parameters::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));
    }

    #[test]
    fn loads_repositories_and_coerces_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acme.toml");
        fs::write(
            &path,
            r#"
[widgets]
branches = ["^release/.*"]
enable_push = "false"
required_approvals = 2
status_check_contexts = "['ci/build', 'ci/test']"
merge_whitelist_teams = "owners"

[gadgets]
branches = "['^main$', '^develop']"
"#,
        )
        .unwrap();

        let mut policies = load_organization(&path).unwrap();
        policies.sort_by(|a, b| a.repo().cmp(b.repo()));
        assert_eq!(policies.len(), 2);

        let gadgets = &policies[0];
        assert_eq!(gadgets.repo(), &RepoId::new("acme", "gadgets"));
        assert_eq!(gadgets.patterns(), ["^main$", "^develop"]);

        let widgets = &policies[1];
        let params = widgets.parameters();
        assert_eq!(params["enable_push"], json!(false));
        assert_eq!(params["required_approvals"], json!(2));
        assert_eq!(params["status_check_contexts"], json!(["ci/build", "ci/test"]));
        assert_eq!(params["merge_whitelist_teams"], json!("owners"));
        assert!(!params.contains_key(BRANCHES_KEY));
    }

    #[test]
    fn missing_branches_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acme.toml");
        fs::write(&path, "[widgets]\nenable_push = true\n").unwrap();

        let err = load_organization(&path).unwrap_err();
        assert!(matches!(err, PolicyError::MissingBranches { .. }));
    }

    #[test]
    fn non_list_branches_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acme.toml");
        fs::write(&path, "[widgets]\nbranches = \"main\"\n").unwrap();

        let err = load_organization(&path).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidBranches { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acme.toml");
        fs::write(&path, "[widgets\nbranches = []\n").unwrap();

        let err = load_organization(&path).unwrap_err();
        assert!(matches!(err, PolicyError::Parse { .. }));
    }

    #[test]
    fn discovery_only_returns_policy_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("zeta.toml"), "").unwrap();
        fs::write(dir.path().join("acme.toml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("nested.toml")).unwrap();

        let files = discover_policy_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["acme.toml", "zeta.toml"]);
    }

    proptest! {
        #[test]
        fn matches_iff_some_anchored_pattern_matches(
            patterns in prop::collection::vec("[a-z]{1,3}(/\\.\\*)?", 0..5),
            branch in "[a-z]{1,6}(/[a-z0-9.]{1,5})?",
        ) {
            let refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
            let expected = patterns
                .iter()
                .any(|p| Regex::new(&format!("^(?:{p})")).unwrap().is_match(&branch));
            prop_assert_eq!(policy(&refs).matches(&branch), expected);
        }

        #[test]
        fn match_result_ignores_pattern_order(
            patterns in prop::collection::vec("[a-z]{1,3}.*", 0..5),
            branch in "[a-z/]{1,8}",
        ) {
            let forward: Vec<&str> = patterns.iter().map(String::as_str).collect();
            let mut reversed = forward.clone();
            reversed.reverse();
            prop_assert_eq!(policy(&forward).matches(&branch), policy(&reversed).matches(&branch));
        }
    }
}
