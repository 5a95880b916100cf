use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Published,
    Failed,
}

/// A channel post waiting for its publication time, `scheduled_posts`
/// collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub post_id: String,
    pub channel_id: i64,
    pub body: String,
    pub publish_at: String,
    pub status: PostStatus,
    pub created_at: String,
    pub published_at: Option<String>,
}
