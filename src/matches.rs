use std::sync::Arc;

use axum::{debug_handler, extract::State, routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::{
    auth::AuthUser,
    skills::{self, Candidate, SkillSet, UserSummary},
    AppError, AppResult, AppState, RealtimeState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/matches", get(get_matches))
}

#[derive(Debug, Serialize)]
pub struct Match {
    pub user: UserSummary,
    pub score: u32,
}

/// Reciprocal score of one candidate against the requester.
///
/// `gives` counts skills the candidate has that the requester seeks, `gets`
/// counts skills the candidate seeks that the requester has. One-sided
/// overlap is not a match.
pub fn score(requester: &SkillSet, candidate: &SkillSet) -> Option<u32> {
    let gives = candidate.possessed.intersection(&requester.seeking).count();
    let gets = candidate.seeking.intersection(&requester.possessed).count();

    if gives > 0 && gets > 0 {
        Some((gives + gets) as u32)
    } else {
        None
    }
}

/// Score and order candidates, best first. The sort is stable, so equal
/// scores keep the candidates' discovery order and results are repeatable
/// for a fixed snapshot.
pub fn rank(requester: &SkillSet, candidates: Vec<Candidate>) -> Vec<Match> {
    if requester.possessed.is_empty() || requester.seeking.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<Match> = candidates
        .into_iter()
        .filter_map(|c| score(requester, &c.skills).map(|score| Match { user: c.user, score }))
        .collect();

    matches.sort_by(|a, b| b.score.cmp(&a.score));
    matches
}

#[debug_handler(state = AppState)]
async fn get_matches(
    AuthUser(user_id): AuthUser,
    State(db_pool): State<SqlitePool>,
    State(realtime): State<Arc<RealtimeState>>,
) -> AppResult<Json<Value>> {
    let Some(requester) = skills::skill_set(&db_pool, user_id).await? else {
        return Err(AppError::NotFound("User not found".to_owned()));
    };

    // Nothing to trade with or for: skip the candidate scan entirely.
    if requester.possessed.is_empty() || requester.seeking.is_empty() {
        return Ok(Json(json!({ "status": "success", "data": [] })));
    }

    let candidates = skills::candidates(&db_pool, user_id).await?;
    let mut matches = rank(&requester, candidates);
    for m in &mut matches {
        m.user.online = realtime.presence.is_online(m.user.id);
    }

    Ok(Json(json!({ "status": "success", "data": matches })))
}
