use crate::{
    db::{
        NewConversationMessage, NewPromptParams, NewUserParams, PlanParams, SubscriptionPlanId,
        TokenUsage, UserId, VoicePromptId,
    },
    realtime, AppState, Config, Error, Result, VERSION,
};
use axum::{
    extract::Query,
    http::{self, header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::instrument;

const DEFAULT_CONVERSATION_LIMIT: u64 = 6;
const MAX_CONVERSATION_LIMIT: u64 = 100;

pub fn routes(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route(
            "/plans",
            get(get_all_plans)
                .post(create_plan)
                .put(update_plan)
                .delete(delete_plan),
        )
        .layer(middleware::from_fn(validate_api_token));

    let api = Router::new()
        .route("/health", get(health))
        .route(
            "/users",
            get(get_user).post(create_or_update_user).patch(update_user_model),
        )
        .route("/user-voice", get(get_user_voice).post(update_user_voice))
        .route(
            "/tokens",
            get(get_token_balance).patch(deduct_tokens).put(add_tokens),
        )
        .route("/plans", get(get_active_plans))
        .route("/user-plans", get(get_user_plans).post(open_subscription))
        .route("/user-current-plan", get(get_current_plan))
        .route("/prompts", get(get_prompts).post(create_prompt))
        .route("/user-prompt", get(get_selected_prompt).post(select_prompt).delete(delete_prompt))
        .route("/conversation", get(get_conversation).post(save_message))
        .route("/token", get(create_realtime_token))
        .nest("/admin", admin);

    let cors = cors_layer(&state.config);
    Router::new().nest("/api", api).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(Extension(state)),
    )
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = config
        .allowed_origins()
        .into_iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid allowed origin");
                None
            }
        })
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
        .expose_headers([header::CONTENT_LENGTH])
        .allow_credentials(true)
}

pub async fn validate_api_token<B>(req: Request<B>, next: Next<B>) -> impl IntoResponse {
    let token = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .ok_or_else(|| {
            Error::http(
                StatusCode::UNAUTHORIZED,
                "missing authorization header".to_string(),
            )
        })?
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            Error::http(
                StatusCode::BAD_REQUEST,
                "invalid authorization header".to_string(),
            )
        })?;

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| anyhow::anyhow!("application state is missing"))?;

    if token != state.config.api_token {
        Err(Error::http(
            StatusCode::UNAUTHORIZED,
            "invalid authorization token".to_string(),
        ))?
    }

    Ok::<_, Error>(next.run(req).await)
}

/// The `{ "success": true, "data": ... }` body every successful call returns.
/// Failures are rendered by [`Error`]'s `IntoResponse`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

type ApiResult<T> = Result<Json<Envelope<T>>>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        data,
    }))
}

#[derive(Debug, Deserialize)]
struct UserIdParams {
    user_id: UserId,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health() -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        status: "ok",
        service: "voice_backend",
        version: VERSION,
    })
}

async fn create_or_update_user(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<NewUserParams>,
) -> ApiResult<crate::db::UserWithPlan> {
    ok(app
        .db
        .create_or_update_user(&params, app.config.default_token_balance)
        .await?)
}

#[derive(Debug, Deserialize)]
struct GetUserParams {
    user_id: Option<UserId>,
    telegram_id: Option<String>,
}

async fn get_user(
    Query(params): Query<GetUserParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<crate::db::UserWithPlan> {
    let user = match (params.user_id, params.telegram_id) {
        (Some(user_id), _) => app.db.get_user_by_id(user_id).await?,
        (None, Some(telegram_id)) => app.db.get_user_by_telegram_id(&telegram_id).await?,
        (None, None) => {
            return Err(Error::InvalidArgument(
                "user_id or telegram_id is required".into(),
            ))
        }
    };
    ok(user)
}

#[derive(Debug, Deserialize)]
struct UpdateModelParams {
    user_id: UserId,
    selected_model: String,
}

async fn update_user_model(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<UpdateModelParams>,
) -> ApiResult<crate::db::user::Model> {
    ok(app
        .db
        .update_selected_model(params.user_id, &params.selected_model)
        .await?)
}

#[derive(Debug, Deserialize, Serialize)]
struct VoiceSelection {
    user_id: UserId,
    voice: String,
}

async fn get_user_voice(
    Query(params): Query<UserIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<VoiceSelection> {
    let voice = app.db.get_selected_voice(params.user_id).await?;
    ok(VoiceSelection {
        user_id: params.user_id,
        voice,
    })
}

async fn update_user_voice(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<VoiceSelection>,
) -> ApiResult<VoiceSelection> {
    app.db
        .update_selected_voice(params.user_id, &params.voice)
        .await?;
    ok(params)
}

#[derive(Debug, Serialize)]
struct TokenBalance {
    user_id: UserId,
    token_balance: i32,
}

async fn get_token_balance(
    Query(params): Query<UserIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<TokenBalance> {
    let token_balance = app.db.get_token_balance(params.user_id).await?;
    ok(TokenBalance {
        user_id: params.user_id,
        token_balance,
    })
}

#[derive(Debug, Deserialize)]
struct DeductTokensParams {
    user_id: UserId,
    #[serde(default)]
    session_id: String,
    usage: TokenUsage,
    #[serde(default)]
    check_only: bool,
}

#[instrument(skip(app, params), fields(user_id = %params.user_id))]
async fn deduct_tokens(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<DeductTokensParams>,
) -> ApiResult<crate::db::TokenUsageResponse> {
    ok(app
        .db
        .deduct_tokens(
            params.user_id,
            &params.usage,
            &params.session_id,
            params.check_only,
        )
        .await?)
}

#[derive(Debug, Deserialize)]
struct AddTokensParams {
    user_id: UserId,
    tokens_to_add: i32,
}

async fn add_tokens(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<AddTokensParams>,
) -> ApiResult<TokenBalance> {
    let token_balance = app
        .db
        .add_tokens(params.user_id, params.tokens_to_add)
        .await?;
    ok(TokenBalance {
        user_id: params.user_id,
        token_balance,
    })
}

#[derive(Debug, Serialize)]
struct Plans {
    plans: Vec<crate::db::subscription_plan::Model>,
}

async fn get_active_plans(Extension(app): Extension<Arc<AppState>>) -> ApiResult<Plans> {
    ok(Plans {
        plans: app.db.get_active_plans().await?,
    })
}

async fn get_user_plans(
    Query(params): Query<UserIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<crate::db::UserPlans> {
    ok(app.db.get_user_plans(params.user_id).await?)
}

#[derive(Debug, Deserialize)]
struct OpenSubscriptionParams {
    user_id: UserId,
    plan_id: SubscriptionPlanId,
    #[serde(default)]
    payment_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenedSubscription {
    subscription_id: crate::db::UserSubscriptionId,
    token_balance: i32,
}

#[instrument(skip(app, params), fields(user_id = %params.user_id, plan_id = %params.plan_id))]
async fn open_subscription(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<OpenSubscriptionParams>,
) -> ApiResult<OpenedSubscription> {
    let (subscription_id, token_balance) = app
        .db
        .open_subscription(params.user_id, params.plan_id, params.payment_id)
        .await?;
    ok(OpenedSubscription {
        subscription_id,
        token_balance,
    })
}

/// Reports the user's plan. Expires the active subscription when its
/// allotment is used up.
async fn get_current_plan(
    Query(params): Query<UserIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<crate::db::CurrentPlanDetail> {
    ok(app.db.get_current_plan_detail(params.user_id).await?)
}

async fn get_prompts(
    Query(params): Query<UserIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<crate::db::UserPrompts> {
    ok(app.db.get_user_prompts(params.user_id).await?)
}

#[derive(Debug, Deserialize)]
struct CreatePromptParams {
    user_id: UserId,
    #[serde(flatten)]
    prompt: NewPromptParams,
}

#[derive(Debug, Serialize)]
struct Prompt {
    prompt: crate::db::voice_prompt::Model,
}

async fn create_prompt(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<CreatePromptParams>,
) -> ApiResult<Prompt> {
    let prompt = app.db.create_prompt(params.user_id, &params.prompt).await?;
    ok(Prompt { prompt })
}

#[derive(Debug, Serialize)]
struct SelectedPrompt {
    prompt: Option<crate::db::voice_prompt::Model>,
}

async fn get_selected_prompt(
    Query(params): Query<UserIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<SelectedPrompt> {
    ok(SelectedPrompt {
        prompt: app.db.get_selected_prompt(params.user_id).await?,
    })
}

#[derive(Debug, Deserialize)]
struct PromptSelection {
    user_id: UserId,
    prompt_id: VoicePromptId,
}

#[derive(Debug, Serialize)]
struct SelectedPromptId {
    selected_prompt_id: VoicePromptId,
}

async fn select_prompt(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<PromptSelection>,
) -> ApiResult<SelectedPromptId> {
    app.db
        .select_prompt(params.user_id, params.prompt_id)
        .await?;
    ok(SelectedPromptId {
        selected_prompt_id: params.prompt_id,
    })
}

#[derive(Debug, Serialize)]
struct DeletedPrompt {
    was_selected: bool,
}

async fn delete_prompt(
    Query(params): Query<PromptSelection>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<DeletedPrompt> {
    let was_selected = app
        .db
        .delete_prompt(params.user_id, params.prompt_id)
        .await?;
    ok(DeletedPrompt { was_selected })
}

#[derive(Debug, Deserialize)]
struct ConversationParams {
    user_id: UserId,
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
struct Conversation {
    messages: Vec<crate::db::conversation_message::Model>,
}

async fn get_conversation(
    Query(params): Query<ConversationParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<Conversation> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_CONVERSATION_LIMIT)
        .clamp(1, MAX_CONVERSATION_LIMIT);
    ok(Conversation {
        messages: app
            .db
            .get_recent_conversation(params.user_id, limit)
            .await?,
    })
}

#[derive(Debug, Deserialize)]
struct SaveMessageParams {
    user_id: UserId,
    #[serde(flatten)]
    message: NewConversationMessage,
}

#[derive(Debug, Serialize)]
struct SavedMessage {
    message_id: crate::db::ConversationMessageId,
}

async fn save_message(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<SaveMessageParams>,
) -> ApiResult<SavedMessage> {
    let message_id = app
        .db
        .save_conversation_message(params.user_id, &params.message)
        .await?;
    ok(SavedMessage { message_id })
}

#[derive(Debug, Deserialize)]
struct RealtimeTokenParams {
    user_id: Option<UserId>,
}

async fn create_realtime_token(
    Query(params): Query<RealtimeTokenParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<serde_json::Value> {
    let Some(client) = app.realtime_client.as_ref() else {
        return Err(Error::http(
            StatusCode::SERVICE_UNAVAILABLE,
            "realtime credentials are not configured".into(),
        ));
    };
    ok(realtime::create_session_token(&app.db, client.as_ref(), params.user_id).await?)
}

async fn get_all_plans(Extension(app): Extension<Arc<AppState>>) -> ApiResult<Plans> {
    ok(Plans {
        plans: app.db.get_all_plans().await?,
    })
}

#[derive(Debug, Serialize)]
struct Plan {
    plan: crate::db::subscription_plan::Model,
}

async fn create_plan(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<PlanParams>,
) -> ApiResult<Plan> {
    ok(Plan {
        plan: app.db.create_plan(&params).await?,
    })
}

#[derive(Debug, Deserialize)]
struct UpdatePlanParams {
    plan_id: SubscriptionPlanId,
    #[serde(flatten)]
    plan: PlanParams,
}

async fn update_plan(
    Extension(app): Extension<Arc<AppState>>,
    Json(params): Json<UpdatePlanParams>,
) -> ApiResult<Plan> {
    ok(Plan {
        plan: app.db.update_plan(params.plan_id, &params.plan).await?,
    })
}

#[derive(Debug, Deserialize)]
struct PlanIdParams {
    plan_id: SubscriptionPlanId,
}

#[derive(Debug, Serialize)]
struct DeletedPlan {
    plan_id: SubscriptionPlanId,
}

async fn delete_plan(
    Query(params): Query<PlanIdParams>,
    Extension(app): Extension<Arc<AppState>>,
) -> ApiResult<DeletedPlan> {
    app.db.delete_plan(params.plan_id).await?;
    ok(DeletedPlan {
        plan_id: params.plan_id,
    })
}
