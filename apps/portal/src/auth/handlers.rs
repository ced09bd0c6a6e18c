use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::identity::{Identity, Role, SessionView};
use crate::models::remote::SignUpData;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
}

#[derive(Deserialize)]
pub struct SelectRoleRequest {
    pub role: String,
}

#[derive(Deserialize)]
pub struct IdentifierRequest {
    pub value: String,
}

#[derive(Serialize)]
pub struct RoleResponse {
    pub role: Role,
}

#[derive(Serialize)]
pub struct SelectRoleResponse {
    pub updated: bool,
    pub role: Role,
}

#[derive(Serialize)]
pub struct IdentifierResponse {
    pub name: String,
    pub value: Option<String>,
}

fn validate_credentials(email: &str, password: &str) -> Result<(), AppError> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(AppError::Validation("A valid email is required".to_string()));
    }
    if password.is_empty() {
        return Err(AppError::Validation("Password is required".to_string()));
    }
    Ok(())
}

fn parse_role(raw: &str) -> Result<Role, AppError> {
    Role::parse(raw).ok_or_else(|| {
        AppError::Validation(format!(
            "Unknown role '{raw}': expected candidate, recruiter or client"
        ))
    })
}

/// GET /api/v1/session
pub async fn handle_get_session(State(state): State<AppState>) -> Json<SessionView> {
    Json(state.resolver.view())
}

/// POST /api/v1/auth/sign-in
pub async fn handle_sign_in(
    State(state): State<AppState>,
    Json(req): Json<SignInRequest>,
) -> Result<Json<Identity>, AppError> {
    validate_credentials(&req.email, &req.password)?;
    let identity = state.resolver.sign_in(req.email.trim(), &req.password).await?;
    Ok(Json(identity))
}

/// POST /api/v1/auth/sign-up
pub async fn handle_sign_up(
    State(state): State<AppState>,
    Json(req): Json<SignUpRequest>,
) -> Result<Json<Identity>, AppError> {
    validate_credentials(&req.email, &req.password)?;
    let role = parse_role(&req.role)?;
    let data = SignUpData {
        name: req.name.filter(|n| !n.trim().is_empty()),
        role,
    };
    let identity = state
        .resolver
        .sign_up(req.email.trim(), &req.password, data)
        .await?;
    Ok(Json(identity))
}

/// POST /api/v1/auth/sign-out
/// Always succeeds from the caller's point of view.
pub async fn handle_sign_out(State(state): State<AppState>) -> Json<SessionView> {
    state.resolver.sign_out().await;
    Json(state.resolver.view())
}

/// GET /api/v1/role
pub async fn handle_get_role(State(state): State<AppState>) -> Json<RoleResponse> {
    Json(RoleResponse {
        role: state.resolver.resolved_role(),
    })
}

/// POST /api/v1/role/refresh
/// `unresolved` in the response means the user still has to pick a role.
pub async fn handle_refresh_role(
    State(state): State<AppState>,
) -> Result<Json<RoleResponse>, AppError> {
    let role = state.resolver.refresh_role().await?;
    Ok(Json(RoleResponse { role }))
}

/// PUT /api/v1/role
pub async fn handle_select_role(
    State(state): State<AppState>,
    Json(req): Json<SelectRoleRequest>,
) -> Result<Json<SelectRoleResponse>, AppError> {
    let role = parse_role(&req.role)?;
    if state.resolver.identity().is_none() {
        return Err(AppError::Unauthorized);
    }
    let updated = state.resolver.select_role(role).await?;
    Ok(Json(SelectRoleResponse {
        updated,
        role: state.resolver.resolved_role(),
    }))
}

/// GET /api/v1/identifiers/:name
pub async fn handle_get_identifier(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<IdentifierResponse> {
    let value = state.resolver.pass_through(&name);
    Json(IdentifierResponse { name, value })
}

/// PUT /api/v1/identifiers/:name
pub async fn handle_put_identifier(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<IdentifierRequest>,
) -> Result<Json<IdentifierResponse>, AppError> {
    if state.resolver.identity().is_none() {
        return Err(AppError::Unauthorized);
    }
    state.resolver.set_pass_through(&name, &req.value);
    Ok(Json(IdentifierResponse {
        name,
        value: Some(req.value),
    }))
}
