//! Typed inbound webhook events, as published to a topic by an external
//! producer.
//!
//! Only `issue_comment` events carry a typed payload; other event types are
//! accepted with the raw type and path and no payload.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid event path")]
    InvalidPath,

    #[error("Malformed {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct User {
    pub login: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Issue {
    pub number: Option<u64>,
    pub state: Option<String>,
    #[serde(default)]
    pub assignees: Vec<User>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Repository {
    pub name: Option<String>,
    pub owner: Option<User>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Comment {
    pub body: Option<String>,
    pub user: Option<User>,
}

/// Payload of an `issue_comment` event.
#[derive(Clone, Debug, Deserialize)]
pub struct IssueCommentEvent {
    pub action: Option<String>,
    pub issue: Option<Issue>,
    pub comment: Option<Comment>,
    #[serde(rename = "repository")]
    pub repo: Option<Repository>,
}

/// A webhook event identified by its type string.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub event_type: String,
    pub path: String,
    pub issue_comment: Option<IssueCommentEvent>,
}

impl InboundEvent {
    /// Parse a raw webhook delivery.
    pub fn parse(event_type: &str, event_path: &str, data: &[u8]) -> Result<Self, IngestError> {
        if event_path.is_empty() {
            return Err(IngestError::InvalidPath);
        }

        let issue_comment = match event_type {
            "issue_comment" => Some(serde_json::from_slice(data).map_err(|source| {
                IngestError::Payload {
                    event_type: event_type.to_string(),
                    source,
                }
            })?),
            _ => None,
        };

        Ok(Self {
            event_type: event_type.to_string(),
            path: event_path.to_string(),
            issue_comment,
        })
    }

    fn issue(&self) -> Option<&Issue> {
        self.issue_comment.as_ref()?.issue.as_ref()
    }

    /// Logins of the issue's assignees.
    pub fn issue_assignees(&self) -> Vec<String> {
        self.issue()
            .map(|issue| {
                issue
                    .assignees
                    .iter()
                    .filter_map(|user| user.login.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn issue_number(&self) -> Option<u64> {
        self.issue()?.number
    }

    pub fn issue_state(&self) -> Option<&str> {
        self.issue()?.state.as_deref()
    }

    /// Login of the repository owner.
    pub fn issue_org(&self) -> Option<&str> {
        let repo = self.issue_comment.as_ref()?.repo.as_ref()?;
        repo.owner.as_ref()?.login.as_deref()
    }

    pub fn issue_repo(&self) -> Option<&str> {
        self.issue_comment.as_ref()?.repo.as_ref()?.name.as_deref()
    }

    /// Body of the comment that triggered the event.
    pub fn comment_body(&self) -> Option<&str> {
        self.issue_comment.as_ref()?.comment.as_ref()?.body.as_deref()
    }

    /// Login of the comment's author.
    pub fn commenter(&self) -> Option<&str> {
        let comment = self.issue_comment.as_ref()?.comment.as_ref()?;
        comment.user.as_ref()?.login.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issue_comment_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": "created",
            "issue": {
                "number": 42,
                "state": "open",
                "assignees": [{"login": "alice"}, {"login": "bob"}]
            },
            "comment": {"body": "/assign", "user": {"login": "carol"}},
            "repository": {"name": "go-sdk", "owner": {"login": "dapr"}}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_issue_comment() {
        let event = InboundEvent::parse("issue_comment", "/tmp/event.json", &issue_comment_payload())
            .unwrap();

        assert_eq!(event.issue_assignees(), vec!["alice", "bob"]);
        assert_eq!(event.issue_number(), Some(42));
        assert_eq!(event.issue_state(), Some("open"));
        assert_eq!(event.issue_org(), Some("dapr"));
        assert_eq!(event.issue_repo(), Some("go-sdk"));
        assert_eq!(event.comment_body(), Some("/assign"));
        assert_eq!(event.commenter(), Some("carol"));
    }

    #[test]
    fn test_empty_path_rejected() {
        let result = InboundEvent::parse("issue_comment", "", &issue_comment_payload());
        assert!(matches!(result, Err(IngestError::InvalidPath)));
    }

    #[test]
    fn test_other_event_types_have_no_payload() {
        let event = InboundEvent::parse("push", "/tmp/event.json", b"not json").unwrap();
        assert_eq!(event.event_type, "push");
        assert!(event.issue_comment.is_none());
        assert!(event.issue_assignees().is_empty());
        assert_eq!(event.issue_number(), None);
    }

    #[test]
    fn test_malformed_issue_comment() {
        let result = InboundEvent::parse("issue_comment", "/tmp/event.json", b"{");
        assert!(matches!(result, Err(IngestError::Payload { .. })));
    }
}
