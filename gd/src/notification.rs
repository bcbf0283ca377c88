//! Push notifications and the filter that decides whether one triggers a release

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DeployTarget;

/// A push event as delivered by the webhook
///
/// Only the fields the deploy decision needs are decoded; everything else in
/// the payload is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    #[serde(rename = "ref")]
    pub git_ref: String,

    pub repository: Repository,

    /// Absent when the push deleted the branch
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

impl PushNotification {
    pub fn new(git_ref: &str, organization: &str, name: &str, commit: &str) -> Self {
        Self {
            git_ref: git_ref.to_string(),
            repository: Repository {
                name: name.to_string(),
                organization: Some(organization.to_string()),
                owner: None,
            },
            head_commit: Some(HeadCommit { id: commit.to_string() }),
        }
    }

    /// The owning organization, falling back to the owner's login or name
    pub fn organization(&self) -> Option<&str> {
        let repo = &self.repository;
        repo.organization
            .as_deref()
            .or_else(|| repo.owner.as_ref().and_then(|o| o.login.as_deref()))
            .or_else(|| repo.owner.as_ref().and_then(|o| o.name.as_deref()))
    }

    /// Head commit id, empty when the payload carries none
    pub fn head_commit_id(&self) -> &str {
        self.head_commit.as_ref().map(|c| c.id.as_str()).unwrap_or("")
    }
}

/// Why a notification was or was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept { commit: String },
    WrongRef { expected: String, got: String },
    WrongRepository { expected: String, got: String },
    MissingCommit,
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }
}

impl std::fmt::Display for FilterDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept { commit } => write!(f, "accepted commit {}", commit),
            Self::WrongRef { expected, got } => write!(f, "ref {} is not {}", got, expected),
            Self::WrongRepository { expected, got } => write!(f, "repository {} is not {}", got, expected),
            Self::MissingCommit => write!(f, "no head commit"),
        }
    }
}

/// Accept iff ref, organization and repository name all match the target
pub fn evaluate(target: &DeployTarget, notification: &PushNotification) -> FilterDecision {
    debug!(git_ref = %notification.git_ref, "evaluate: called");
    let expected_ref = target.branch_ref();
    if notification.git_ref != expected_ref {
        return FilterDecision::WrongRef {
            expected: expected_ref,
            got: notification.git_ref.clone(),
        };
    }

    let org = notification.organization().unwrap_or("");
    if org != target.org || notification.repository.name != target.repo_name {
        return FilterDecision::WrongRepository {
            expected: target.repository(),
            got: format!("{}/{}", org, notification.repository.name),
        };
    }

    let commit = notification.head_commit_id();
    if commit.is_empty() {
        return FilterDecision::MissingCommit;
    }

    FilterDecision::Accept {
        commit: commit.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DeployTarget {
        DeployTarget::new("acme/site", "master", "/srv/site").unwrap()
    }

    #[test]
    fn test_accepts_matching_push() {
        let n = PushNotification::new("refs/heads/master", "acme", "site", "abc123");
        assert_eq!(
            evaluate(&target(), &n),
            FilterDecision::Accept {
                commit: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_other_branch() {
        let n = PushNotification::new("refs/heads/feature", "acme", "site", "abc123");
        let decision = evaluate(&target(), &n);
        assert!(matches!(decision, FilterDecision::WrongRef { .. }));
        assert_eq!(decision.to_string(), "ref refs/heads/feature is not refs/heads/master");
    }

    #[test]
    fn test_rejects_tag_with_branch_name() {
        let n = PushNotification::new("refs/tags/master", "acme", "site", "abc123");
        assert!(!evaluate(&target(), &n).is_accepted());
    }

    #[test]
    fn test_rejects_other_organization_or_name() {
        let n = PushNotification::new("refs/heads/master", "other", "site", "abc123");
        assert!(matches!(evaluate(&target(), &n), FilterDecision::WrongRepository { .. }));

        let n = PushNotification::new("refs/heads/master", "acme", "blog", "abc123");
        assert!(matches!(evaluate(&target(), &n), FilterDecision::WrongRepository { .. }));
    }

    #[test]
    fn test_rejects_branch_deletion() {
        let mut n = PushNotification::new("refs/heads/master", "acme", "site", "x");
        n.head_commit = None;
        assert_eq!(evaluate(&target(), &n), FilterDecision::MissingCommit);
    }

    #[test]
    fn test_decode_with_organization_field() {
        let body = br#"{
            "ref": "refs/heads/master",
            "before": "000",
            "repository": {"name": "site", "organization": "acme", "private": false},
            "head_commit": {"id": "f00d", "message": "ship it"}
        }"#;
        let n = serde_json::from_slice::<PushNotification>(body).unwrap();
        assert_eq!(n.organization(), Some("acme"));
        assert_eq!(n.head_commit_id(), "f00d");
        assert!(evaluate(&target(), &n).is_accepted());
    }

    #[test]
    fn test_decode_falls_back_to_owner() {
        let body = br#"{
            "ref": "refs/heads/master",
            "repository": {"name": "site", "owner": {"login": "acme", "id": 1}},
            "head_commit": null
        }"#;
        let n = serde_json::from_slice::<PushNotification>(body).unwrap();
        assert_eq!(n.organization(), Some("acme"));
        assert_eq!(n.head_commit_id(), "");
    }

    #[test]
    fn test_decode_rejects_missing_ref() {
        let body = br#"{"repository": {"name": "site"}}"#;
        assert!(serde_json::from_slice::<PushNotification>(body).is_err());
    }
}
