use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Internal user identifier (UUIDv7 — time-sortable for easier log correlation).
///
/// Every user also has an external (Telegram) numeric id; the internal id is
/// the primary key in both stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation id carried across every event of one logical workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Profile role hierarchy: admin > vip > free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Vip,
    #[default]
    Free,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::Vip => write!(f, "vip"),
            UserRole::Free => write!(f, "free"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "vip" => Ok(UserRole::Vip),
            "free" => Ok(UserRole::Free),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Premium,
    Vip,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Free => write!(f, "free"),
            Plan::Premium => write!(f, "premium"),
            Plan::Vip => write!(f, "vip"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "premium" => Ok(Plan::Premium),
            "vip" => Ok(Plan::Vip),
            other => Err(format!("unknown plan: {}", other)),
        }
    }
}

/// Subscription lifecycle state.
///
/// Legal transitions form a DAG: active → cancelled, active → expired,
/// inactive → active. Everything else is rejected at the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Active, Cancelled) | (Active, Expired) | (Inactive, Active)
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::Inactive => write!(f, "inactive"),
            SubscriptionStatus::Cancelled => write!(f, "cancelled"),
            SubscriptionStatus::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn user_ids_are_unique_and_sortable() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b);
        // UUIDv7 embeds the timestamp, so ids created later sort later.
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn role_round_trips_through_strings() {
        for role in [UserRole::Admin, UserRole::Vip, UserRole::Free] {
            assert_eq!(UserRole::from_str(&role.to_string()).unwrap(), role);
        }
        assert!(UserRole::from_str("owner").is_err());
    }

    #[test]
    fn subscription_dag_allows_only_legal_edges() {
        use SubscriptionStatus::*;
        assert!(Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Expired));
        assert!(Inactive.can_transition_to(Active));

        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Active.can_transition_to(Inactive));
        assert!(!Expired.can_transition_to(Cancelled));
    }
}
