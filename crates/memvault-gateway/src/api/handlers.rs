// crates/memvault-gateway/src/api/handlers.rs
// One handler per RPC; each unwraps the body and calls the memory service

use super::{ApiError, ApiResult, AppState};
use crate::auth::Caller;
use crate::db::DataKeyRow;
use axum::{
    Extension, Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
};
use memvault_types::{
    DeleteMemoryResponse, HealthResponse, MemoriesResponse, Memory, MemoryFilter,
    PatchMemoryRequest, RotateKeyRequest, RotateKeyResponse, SearchMemoriesRequest,
    SearchMemoriesResponse, StoreMemoryRequest, StoreMemoryResponse,
};
use serde::Deserialize;
use std::sync::Arc;

type Body<T> = Result<Json<T>, JsonRejection>;

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct KeyListParams {
    pub scope: Option<String>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.service.health().await)
}

pub async fn store_memory(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    body: Body<StoreMemoryRequest>,
) -> ApiResult<Json<StoreMemoryResponse>> {
    let Json(req) = body?;
    Ok(Json(state.service.store(&caller, req).await?))
}

pub async fn search_memories(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    body: Body<SearchMemoriesRequest>,
) -> ApiResult<Json<SearchMemoriesResponse>> {
    let Json(req) = body?;
    Ok(Json(state.service.search(&caller, req).await?))
}

pub async fn recent_memories(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    params: Result<Query<RecentParams>, QueryRejection>,
) -> ApiResult<Json<MemoriesResponse>> {
    let Query(params) = params?;
    Ok(Json(state.service.recent(&caller, params.limit).await?))
}

pub async fn query_memories(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    body: Body<MemoryFilter>,
) -> ApiResult<Json<MemoriesResponse>> {
    let Json(filter) = body?;
    Ok(Json(state.service.query(&caller, filter).await?))
}

pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Memory>> {
    Ok(Json(state.service.get(&caller, &id).await?))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteMemoryResponse>> {
    Ok(Json(state.service.delete(&caller, &id).await?))
}

pub async fn patch_memory(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Body<PatchMemoryRequest>,
) -> ApiResult<Json<Memory>> {
    let Json(req) = body?;
    Ok(Json(state.service.patch(&caller, &id, req).await?))
}

pub async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    body: Body<RotateKeyRequest>,
) -> ApiResult<Json<RotateKeyResponse>> {
    require_admin(&caller)?;
    let Json(req) = body?;
    Ok(Json(
        state
            .service
            .rotate(&caller, &req.scope, req.reencrypt)
            .await?,
    ))
}

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    params: Result<Query<KeyListParams>, QueryRejection>,
) -> ApiResult<Json<Vec<DataKeyRow>>> {
    require_admin(&caller)?;
    let Query(params) = params?;
    Ok(Json(
        state.service.keys().list(params.scope.as_deref()).await?,
    ))
}

fn require_admin(caller: &Caller) -> ApiResult<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin role required"))
    }
}
