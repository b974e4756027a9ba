use std::collections::{HashMap, HashSet};

use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::AppResult;

/// A user's two skill-ID sets, read fresh from the profile store.
#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    pub possessed: HashSet<Uuid>,
    pub seeking: HashSet<Uuid>,
}

/// Participant metadata exposed alongside matches and interactions.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub online: bool,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub user: UserSummary,
    pub skills: SkillSet,
}

/// Snapshot of one user's skill sets, or `None` if the user does not exist.
///
/// A user with no skills rows is still `Some` (an empty set, not a missing
/// user), so callers can tell "no skills yet" from "unknown id".
pub async fn skill_set(pool: &SqlitePool, user_id: Uuid) -> AppResult<Option<SkillSet>> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE id=?")
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Ok(None);
    }

    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT skill_id, kind FROM user_skills WHERE user_id=?")
            .bind(user_id.to_string())
            .fetch_all(pool)
            .await?;

    let mut set = SkillSet::default();
    for (skill_id, kind) in rows {
        let Ok(skill_id) = Uuid::parse_str(&skill_id) else {
            continue;
        };
        match kind.as_str() {
            "possessed" => set.possessed.insert(skill_id),
            _ => set.seeking.insert(skill_id),
        };
    }

    Ok(Some(set))
}

/// All users except `requester`, in discovery (insertion) order, each paired
/// with their skill sets. One snapshot per call, no caching.
pub async fn candidates(pool: &SqlitePool, requester: Uuid) -> AppResult<Vec<Candidate>> {
    let users: Vec<(String, String, Option<String>)> =
        sqlx::query_as("SELECT id, username, avatar_url FROM users WHERE id != ? ORDER BY rowid")
            .bind(requester.to_string())
            .fetch_all(pool)
            .await?;

    let rows: Vec<(String, String, String)> =
        sqlx::query_as("SELECT user_id, skill_id, kind FROM user_skills")
            .fetch_all(pool)
            .await?;

    let mut by_user: HashMap<String, SkillSet> = HashMap::new();
    for (user_id, skill_id, kind) in rows {
        let Ok(skill_id) = Uuid::parse_str(&skill_id) else {
            continue;
        };
        let set = by_user.entry(user_id).or_default();
        match kind.as_str() {
            "possessed" => set.possessed.insert(skill_id),
            _ => set.seeking.insert(skill_id),
        };
    }

    let mut out = Vec::with_capacity(users.len());
    for (id, username, avatar_url) in users {
        let skills = by_user.remove(&id).unwrap_or_default();
        let Ok(id) = Uuid::parse_str(&id) else {
            continue;
        };
        out.push(Candidate {
            user: UserSummary { id, username, avatar_url, online: false },
            skills,
        });
    }

    Ok(out)
}

/// Metadata for one user; used to enrich interaction participants.
pub async fn user_summary(pool: &SqlitePool, user_id: Uuid) -> AppResult<Option<UserSummary>> {
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT username, avatar_url FROM users WHERE id=?")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(username, avatar_url)| UserSummary {
        id: user_id,
        username,
        avatar_url,
        online: false,
    }))
}

#[cfg(test)]
pub(crate) async fn seed_user(
    pool: &SqlitePool,
    username: &str,
    possessed: &[Uuid],
    seeking: &[Uuid],
) -> Uuid {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO users (id, username) VALUES (?, ?)")
        .bind(id.to_string())
        .bind(username)
        .execute(pool)
        .await
        .unwrap();

    for (skills, kind) in [(possessed, "possessed"), (seeking, "seeking")] {
        for skill in skills {
            sqlx::query("INSERT INTO user_skills (user_id, skill_id, kind) VALUES (?, ?, ?)")
                .bind(id.to_string())
                .bind(skill.to_string())
                .bind(kind)
                .execute(pool)
                .await
                .unwrap();
        }
    }

    id
}
