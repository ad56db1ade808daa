use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an entity that owns aggregates (a user, a post).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Store-assigned identifier of a detail record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetailId(pub u64);

impl DetailId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DetailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detail_{}", self.0)
    }
}

/// Name of a denormalized aggregate field, e.g. `number_of_posts_liked`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterName(pub String);

impl CounterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CounterName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which reference of a detail record an aggregate is counted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRole {
    /// The entity that performed the action (the user who liked).
    Owner,
    /// The secondary entity the action targets (the post that was liked).
    Subject,
}

impl fmt::Display for OwnerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerRole::Owner => write!(f, "owner"),
            OwnerRole::Subject => write!(f, "subject"),
        }
    }
}

/// An authoritative fact row: a like, a comment, a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: DetailId,
    pub collection: String,
    pub owner: EntityId,
    pub subject: Option<EntityId>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DetailRecord {
    /// The entity this record is counted under for `role`, if it has one.
    pub fn key_for(&self, role: OwnerRole) -> Option<&EntityId> {
        match role {
            OwnerRole::Owner => Some(&self.owner),
            OwnerRole::Subject => self.subject.as_ref(),
        }
    }

    /// See [`NewDetail::is_unique`].
    pub fn is_unique(&self) -> bool {
        self.subject.is_some() && self.collection != COMMENTS
    }
}

/// A detail record that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetail {
    pub collection: String,
    pub owner: EntityId,
    pub subject: Option<EntityId>,
    pub payload: serde_json::Value,
}

impl NewDetail {
    pub fn new(collection: impl Into<String>, owner: impl Into<EntityId>) -> Self {
        Self {
            collection: collection.into(),
            owner: owner.into(),
            subject: None,
            payload: serde_json::Value::Null,
        }
    }

    /// A like of `post` by `user`.
    pub fn like(user: impl Into<EntityId>, post: impl Into<EntityId>) -> Self {
        Self::new(LIKES, user).subject(post)
    }

    /// A comment on `post` by `user`.
    pub fn comment(user: impl Into<EntityId>, post: impl Into<EntityId>, text: &str) -> Self {
        Self::new(COMMENTS, user)
            .subject(post)
            .payload(serde_json::json!({ "text": text }))
    }

    pub fn subject(mut self, subject: impl Into<EntityId>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn key_for(&self, role: OwnerRole) -> Option<&EntityId> {
        match role {
            OwnerRole::Owner => Some(&self.owner),
            OwnerRole::Subject => self.subject.as_ref(),
        }
    }

    /// Comments may repeat; every other subject-bearing record is unique per owner and subject.
    pub fn is_unique(&self) -> bool {
        self.subject.is_some() && self.collection != COMMENTS
    }
}

pub const LIKES: &str = "likes";
pub const COMMENTS: &str = "comments";
pub const POSTS: &str = "posts";

/// Address of one materialized aggregate value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub owner: EntityId,
    pub field: CounterName,
}

impl AggregateKey {
    pub fn new(owner: impl Into<EntityId>, field: impl Into<CounterName>) -> Self {
        Self {
            owner: owner.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.field)
    }
}

/// Declares that `field` on an entity is `count(collection where role == entity)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSpec {
    pub field: CounterName,
    pub collection: String,
    pub role: OwnerRole,
}

impl CounterSpec {
    pub fn new(
        field: impl Into<CounterName>,
        collection: impl Into<String>,
        role: OwnerRole,
    ) -> Self {
        Self {
            field: field.into(),
            collection: collection.into(),
            role,
        }
    }

    /// Aggregate key touched by `detail`, or `None` if the detail lacks the counted reference.
    pub fn key_for(&self, detail: &DetailRecord) -> Option<AggregateKey> {
        if detail.collection != self.collection {
            return None;
        }
        detail
            .key_for(self.role)
            .map(|owner| AggregateKey::new(owner.clone(), self.field.clone()))
    }
}

/// The set of materialized counters known to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRegistry {
    specs: Vec<CounterSpec>,
}

impl CounterRegistry {
    pub fn new(specs: Vec<CounterSpec>) -> Self {
        Self { specs }
    }

    /// Counters of a small social app: posts, likes and comments.
    pub fn social() -> Self {
        Self::new(vec![
            CounterSpec::new("number_of_posts_liked", LIKES, OwnerRole::Owner),
            CounterSpec::new("like_count", LIKES, OwnerRole::Subject),
            CounterSpec::new("number_of_comments", COMMENTS, OwnerRole::Owner),
            CounterSpec::new("comment_count", COMMENTS, OwnerRole::Subject),
            CounterSpec::new("number_of_posts", POSTS, OwnerRole::Owner),
        ])
    }

    pub fn get(&self, field: &CounterName) -> Option<&CounterSpec> {
        self.specs.iter().find(|spec| &spec.field == field)
    }

    pub fn require(&self, field: &CounterName) -> super::Result<&CounterSpec> {
        self.get(field)
            .ok_or_else(|| super::TallyError::UnknownCounter(field.to_string()))
    }

    pub fn for_collection<'a>(
        &'a self,
        collection: &'a str,
    ) -> impl Iterator<Item = &'a CounterSpec> + 'a {
        self.specs.iter().filter(move |spec| spec.collection == collection)
    }

    /// Aggregate keys a committed `detail` contributes to.
    pub fn keys_for(&self, detail: &DetailRecord) -> Vec<AggregateKey> {
        self.specs.iter().filter_map(|spec| spec.key_for(detail)).collect()
    }

    /// Aggregate keys `detail` will contribute to once it is committed.
    pub fn keys_for_new(&self, detail: &NewDetail) -> Vec<AggregateKey> {
        self.for_collection(&detail.collection)
            .filter_map(|spec| {
                detail
                    .key_for(spec.role)
                    .map(|owner| AggregateKey::new(owner.clone(), spec.field.clone()))
            })
            .collect()
    }

    pub fn specs(&self) -> &[CounterSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_keys() {
        let registry = CounterRegistry::social();
        let record = DetailRecord {
            id: DetailId(1),
            collection: LIKES.to_string(),
            owner: EntityId::from("alice"),
            subject: Some(EntityId::from("post-1")),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        };

        let keys = registry.keys_for(&record);
        assert_eq!(
            keys,
            vec![
                AggregateKey::new("alice", "number_of_posts_liked"),
                AggregateKey::new("post-1", "like_count"),
            ]
        );
    }

    #[test]
    fn test_subjectless_detail_skips_subject_counters() {
        let spec = CounterSpec::new("like_count", LIKES, OwnerRole::Subject);
        let record = DetailRecord {
            id: DetailId(7),
            collection: LIKES.to_string(),
            owner: EntityId::from("alice"),
            subject: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        assert!(spec.key_for(&record).is_none());
    }

    #[test]
    fn test_uniqueness_rules() {
        assert!(NewDetail::like("alice", "post-1").is_unique());
        assert!(!NewDetail::comment("alice", "post-1", "nice").is_unique());
        assert!(!NewDetail::new(POSTS, "alice").is_unique());
    }

    #[test]
    fn test_unknown_counter() {
        let registry = CounterRegistry::social();
        assert!(registry.require(&CounterName::from("follower_count")).is_err());
        assert_eq!(registry.for_collection(LIKES).count(), 2);
    }
}
