use axum::Router;
use skilltrade::{db, interactions, matches, messages, ratings, realtime, AppState};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let database_url =
        dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://skilltrade.db".to_owned());
    let db_pool = db::connect(&database_url).await?;
    db::init(&db_pool).await?;

    let app_state = AppState::new(db_pool);

    let app = Router::new()
        .merge(matches::router())
        .merge(realtime::router())
        .nest("/interactions", interactions::router())
        .nest("/messages", messages::router())
        .nest("/ratings", ratings::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    info!("skilltrade listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
