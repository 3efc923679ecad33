//! Mentions: append-only evidence backing a connection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MentionSource {
    Post,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub mention_id: Uuid,
    pub connection_id: Uuid,
    pub source_type: MentionSource,
    pub source_id: String,
    pub source_url: String,
    /// Community label the mention came from.
    pub subreddit: String,
    pub content_excerpt: String,
    pub author: Option<String>,
    pub upvotes: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMention {
    pub connection_id: Uuid,
    pub source_type: MentionSource,
    pub source_id: String,
    pub source_url: String,
    pub subreddit: String,
    pub content_excerpt: String,
    pub author: Option<String>,
    pub upvotes: i64,
    pub created_at: DateTime<Utc>,
}

impl NewMention {
    pub fn source_key(&self) -> String {
        format!("{}:{}", self.source_type, self.source_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut missing = Vec::new();
        if self.source_id.trim().is_empty() {
            missing.push("source_id");
        }
        if self.source_url.trim().is_empty() {
            missing.push("source_url");
        }
        if self.subreddit.trim().is_empty() {
            missing.push("subreddit");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields {
                record: "mention",
                fields: missing,
            });
        }
        Url::parse(&self.source_url).map_err(|e| ValidationError::InvalidValue {
            field: "source_url",
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Mention lookup. Results order newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MentionFilter {
    pub connection_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
}

impl MentionFilter {
    pub fn for_connection(connection_id: Uuid) -> Self {
        Self {
            connection_id: Some(connection_id),
            since: None,
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, m: &Mention) -> bool {
        self.connection_id.map_or(true, |id| m.connection_id == id)
            && self.since.map_or(true, |since| m.created_at >= since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> NewMention {
        NewMention {
            connection_id: Uuid::new_v4(),
            source_type: MentionSource::Post,
            source_id: "t3_abc".to_string(),
            source_url: "https://reddit.com/r/austinfood/comments/abc".to_string(),
            subreddit: "austinfood".to_string(),
            content_excerpt: "best brisket in town".to_string(),
            author: Some("smokehound".to_string()),
            upvotes: 42,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_valid_mention_passes() {
        assert!(draft().validate().is_ok());
        assert_eq!(draft().source_key(), "post:t3_abc");
    }

    #[test]
    fn test_missing_source_fields_are_named() {
        let m = NewMention {
            source_id: " ".to_string(),
            subreddit: String::new(),
            ..draft()
        };
        assert_eq!(
            m.validate(),
            Err(ValidationError::MissingFields {
                record: "mention",
                fields: vec!["source_id", "subreddit"],
            })
        );
    }

    #[test]
    fn test_malformed_url_is_invalid() {
        let m = NewMention {
            source_url: "not a url".to_string(),
            ..draft()
        };
        assert!(matches!(
            m.validate(),
            Err(ValidationError::InvalidValue {
                field: "source_url",
                ..
            })
        ));
    }
}
