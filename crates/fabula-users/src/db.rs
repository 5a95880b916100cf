use std::str::FromStr;

use rusqlite::{Connection, Result};

use fabula_core::types::{Plan, SubscriptionStatus, UserRole};

use crate::types::{Profile, Subscription};

/// Map a SELECT row (column order from the profile queries) to a Profile.
/// Centralised here so every query in this crate stays consistent.
pub(crate) fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let role = UserRole::from_str(&row.get::<_, String>(7)?).unwrap_or_default();
    Ok(Profile {
        internal_id: row.get(0)?,
        external_id: row.get(1)?,
        display_name: row.get(2)?,
        language: row.get(3)?,
        created_at: row.get(4)?,
        last_seen_at: row.get(5)?,
        active: row.get::<_, i32>(6)? != 0,
        role,
    })
}

pub(crate) fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let plan = Plan::from_str(&row.get::<_, String>(2)?).unwrap_or_default();
    let status = SubscriptionStatus::from_str(&row.get::<_, String>(3)?)
        .unwrap_or(SubscriptionStatus::Inactive);
    Ok(Subscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan,
        status,
        start_at: row.get(4)?,
        end_at: row.get(5)?,
    })
}

pub(crate) const PROFILE_COLUMNS: &str =
    "internal_id, external_id, display_name, language, created_at, last_seen_at, active, role";

pub(crate) const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan, status, start_at, end_at";

/// Initialise all tables for the users subsystem. Safe to call on every
/// startup — CREATE IF NOT EXISTS means it's idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_profiles_table(conn)?;
    create_subscriptions_table(conn)?;
    Ok(())
}

fn create_profiles_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_profiles (
            internal_id   TEXT PRIMARY KEY NOT NULL,
            external_id   INTEGER NOT NULL UNIQUE,
            display_name  TEXT NOT NULL,
            language      TEXT NOT NULL DEFAULT 'es',
            created_at    TEXT NOT NULL,
            last_seen_at  TEXT NOT NULL,
            active        INTEGER NOT NULL DEFAULT 1,
            role          TEXT NOT NULL DEFAULT 'free'
                          CHECK (role IN ('free', 'vip', 'admin'))
        );
        CREATE INDEX IF NOT EXISTS idx_profiles_external
            ON user_profiles (external_id);",
    )
}

fn create_subscriptions_table(conn: &Connection) -> Result<()> {
    // Status transitions are enforced in the application layer; the CHECK
    // constraints only pin the value domains.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS subscriptions (
            id        TEXT PRIMARY KEY NOT NULL,
            user_id   TEXT NOT NULL REFERENCES user_profiles(internal_id),
            plan      TEXT NOT NULL
                      CHECK (plan IN ('free', 'premium', 'vip')),
            status    TEXT NOT NULL
                      CHECK (status IN ('active', 'inactive', 'cancelled', 'expired')),
            start_at  TEXT NOT NULL,
            end_at    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_user
            ON subscriptions (user_id, status);",
    )
}
