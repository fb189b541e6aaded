//! View models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

/// Content slice handed to the publish pipeline: the oldest unused item.
#[derive(Debug, Clone)]
pub struct PostForPublish {
    pub id: i64,
    pub body: String,
    pub media_refs: Vec<String>,
}

/// Identity slice selected by the rotation cursor for one attempt.
#[derive(Debug, Clone)]
pub struct IdentityForPublish {
    pub id: i64,
    pub label: String,
    pub credential: String,
}
