use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

use gpu_scheduler_domain::entities::RechargeCode;

use crate::{
    auth::CurrentUser,
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// 充值码创建请求（管理员）
#[derive(Debug, Deserialize, Validate)]
pub struct CreateCodeRequest {
    #[validate(range(min = 0.01, message = "充值面额必须大于0"))]
    pub amount: f64,
    #[validate(range(min = 1, max = 10000, message = "使用上限必须在1到10000之间"))]
    pub max_uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 充值码兑换请求
#[derive(Debug, Deserialize, Validate)]
pub struct RedeemRequest {
    #[validate(length(min = 1, max = 64, message = "充值码不能为空"))]
    pub code: String,
}

pub async fn create_code(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateCodeRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    user.require_admin()?;
    request.validate()?;

    let code = RechargeCode::new(
        request.amount,
        request.max_uses,
        request.expires_at,
        user.id.clone(),
    );
    state.ledger.create_code(&code).await?;

    info!("管理员 {} 创建充值码 (面额 {})", user.id, code.amount);
    Ok(created(code))
}

pub async fn redeem_code(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<RedeemRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    request.validate()?;

    let outcome = state.ledger.redeem(&user.id, request.code.trim()).await?;
    info!("用户 {} 兑换充值码，到账 {}", user.id, outcome.amount);
    Ok(success(outcome))
}

pub async fn get_balance(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<impl axum::response::IntoResponse> {
    let balance = state.ledger.balance(&user.id).await?;
    Ok(success(serde_json::json!({
        "user_id": user.id,
        "balance": balance,
    })))
}

pub async fn list_records(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<impl axum::response::IntoResponse> {
    let records = state.ledger.recharge_records(&user.id).await?;
    Ok(success(records))
}
