pub mod auth;
pub mod db;
pub mod error;
pub mod interactions;
pub mod matches;
pub mod messages;
pub mod ratings;
pub mod realtime;
pub mod skills;

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::SqlitePool;

pub use error::{AppError, AppResult};
pub use realtime::RealtimeState;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub realtime: Arc<RealtimeState>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self {
            db_pool,
            realtime: Arc::new(RealtimeState::new()),
        }
    }
}
