use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use sidebar_gateway::Dispatcher;
use sidebar_gateway::connection;
use sidebar_types::Claims;

#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct ConnectParams {
    token: String,
}

/// Validate the query token before upgrading. A bad token is rejected at
/// the HTTP layer and never reaches the gateway loop.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = authenticate(&params.token, &state.jwt_secret) else {
        warn!("gateway upgrade rejected: invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.dispatcher, user_id))
        .into_response()
}

/// Decode and validate a JWT, returning the user id it vouches for.
pub fn authenticate(token: &str, secret: &str) -> Option<Uuid> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token_for(user: Uuid, secret: &str, exp: usize) -> String {
        let claims = Claims { sub: user, exp };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_the_user_id() {
        let user = Uuid::new_v4();
        let token = token_for(user, "secret", 4_102_444_800);
        assert_eq!(authenticate(&token, "secret"), Some(user));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token_for(Uuid::new_v4(), "secret", 1_000_000);
        assert_eq!(authenticate(&token, "secret"), None);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token_for(Uuid::new_v4(), "secret", 4_102_444_800);
        assert_eq!(authenticate(&token, "other"), None);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert_eq!(authenticate("definitely-not-a-jwt", "secret"), None);
    }
}
