use axum::{
    extract::FromRef,
    http::{header, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
    routing, Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api::{
        self,
        v1::{
            auth::UserCollection, driver::DriverLocationCollection, pickup::PickupCollection,
            pickup::PricingPolicy, token::JwtState,
        },
    },
    config::Config,
    error::Error,
    migrate::MigrationCollection,
    payment::PaymentCollection,
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,
    pub pricing: PricingPolicy,

    pub mongo_client: mongodb::Client,
    pub user_collection: UserCollection,
    pub pickup_collection: PickupCollection,
    pub location_collection: DriverLocationCollection,
    pub payment_collection: PaymentCollection,
    pub migrate_collection: MigrationCollection,
}

impl AppState {
    /// Builds the state for `config`. The driver connects lazily, so this succeeds without a
    /// reachable server as long as the URI parses.
    pub async fn new(config: &Config) -> Result<Self, mongodb::error::Error> {
        let argon = argon2::Argon2::default();
        let jwt_state = JwtState::new(&config.jwt_secret, config.token_ttl);

        let mongo_client_opt = mongodb::options::ClientOptions::parse(&config.mongo_uri).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(&config.database_name);
        Ok(Self {
            argon,
            jwt_state,
            pricing: PricingPolicy {
                unit_rate: config.unit_rate,
            },

            mongo_client,
            user_collection: UserCollection(db.collection("users").into()),
            pickup_collection: PickupCollection(db.collection("pickups").into()),
            location_collection: DriverLocationCollection(
                db.collection("driver_locations").into(),
            ),
            payment_collection: PaymentCollection(db.collection("payments").into()),
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
        })
    }
}

fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", routing::post(api::v1::auth::register))
        .route("/login", routing::post(api::v1::auth::login))
        .route("/logout", routing::post(api::v1::auth::logout))
}

fn user_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/profile",
            routing::get(api::v1::user::profile).put(api::v1::user::update_profile),
        )
        .route("/drivers", routing::get(api::v1::user::drivers))
}

fn pickup_routes() -> Router<AppState> {
    use api::v1::pickup;

    Router::new()
        .route("/", routing::get(pickup::index).post(pickup::create))
        .route("/my", routing::get(pickup::mine))
        .route("/estimate", routing::post(pickup::estimate))
        .route("/:id", routing::get(pickup::show).put(pickup::update))
        .route("/:id/assign", routing::put(pickup::assign))
        .route("/:id/start", routing::put(pickup::start))
        .route("/:id/complete", routing::put(pickup::complete))
        .route("/:id/cancel", routing::put(pickup::cancel))
}

fn driver_routes() -> Router<AppState> {
    use api::v1::driver;

    Router::new()
        .route(
            "/location",
            routing::post(driver::update_location).delete(driver::remove_location),
        )
        .route("/location/:id", routing::get(driver::show))
        .route("/available", routing::get(driver::available))
}

fn cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin
                .parse()
                .map_err(|_| tracing::warn!("ignoring malformed CORS origin {}", origin))
                .ok()
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn fallback(uri: Uri) -> Error {
    Error::NotFound(uri)
}

fn panic_response(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    Error::Panic.into_response()
}

pub fn router(state: AppState, config: &Config) -> Router {
    crate::error::expose_internal_detail(config.is_development());

    let routes = Router::new()
        .route("/", routing::get(api::welcome))
        .nest("/auth", auth_routes())
        .nest("/users", user_routes())
        .nest("/pickups", pickup_routes())
        .nest("/pickup", pickup_routes())
        .nest("/driver", driver_routes());

    Router::new()
        .nest("/api", routes)
        .route("/health", routing::get(api::health))
        .fallback(fallback)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, Bytes},
        http::{Request, StatusCode},
        Router,
    };
    use tower::ServiceExt;

    use crate::api::v1::{
        tests::{bootstrap, detached_app_state, test_config},
        token::generate_access_token_with_exp,
    };

    use super::*;

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Bytes) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();

        (status, bytes)
    }

    async fn send_json(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let (status, bytes) = send(app, method, uri, token, body).await;

        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn detached_router() -> Router {
        router(detached_app_state().await, &test_config())
    }

    #[tokio::test]
    async fn test_health_and_welcome() {
        let app = detached_router().await;

        let (status, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"OK");

        let (status, body) = send_json(&app, Method::GET, "/api", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = detached_router().await;

        let (status, body) = send_json(&app, Method::GET, "/api/nothing", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "NotFound");
    }

    #[tokio::test]
    async fn test_rejects_missing_or_bad_token() {
        let app = detached_router().await;

        let (status, body) = send_json(&app, Method::GET, "/api/pickups", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "No token provided");

        let (status, _) =
            send_json(&app, Method::GET, "/api/pickups", Some("not-a-token"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let state = detached_app_state().await;
        let expired = generate_access_token_with_exp(
            &state.jwt_state,
            &crate::api::v1::token::tests::user_model(crate::api::v1::auth::UserRole::User),
            0,
        )
        .unwrap();

        let (status, body) = send_json(
            &app,
            Method::POST,
            "/api/pickups",
            Some(&expired),
            Some(serde_json::json!({ "quantity": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid access token");
    }

    fn pickup_body(quantity: f64) -> serde_json::Value {
        serde_json::json!({
            "pickupDate": "2030-01-15T09:00:00Z",
            "wasteType": "recyclable",
            "quantity": quantity,
            "pickupAddress": {
                "street": "123 Test St",
                "city": "Test City",
                "coordinates": { "lat": 10, "lng": 10 }
            },
            "notes": "Test pickup"
        })
    }

    async fn register(app: &Router, email: &str, role: &str) -> (String, String) {
        let (status, body) = send_json(
            app,
            Method::POST,
            "/api/auth/register",
            None,
            Some(serde_json::json!({
                "name": "Test",
                "email": email,
                "password": "password",
                "role": role,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);

        (
            body["token"].as_str().unwrap().to_string(),
            body["user"]["id"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn test_user_pickup_flow() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };
        let app = router(bootstrap.app_state.clone(), &test_config());

        let (token, user_id) = register(&app, "user@test.com", "user").await;

        let (status, created) = send_json(
            &app,
            Method::POST,
            "/api/pickups",
            Some(&token),
            Some(pickup_body(5.0)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["price"], 50.0);
        assert_eq!(created["userId"], user_id.as_str());

        let (status, listed) = send_json(&app, Method::GET, "/api/pickup", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let (status, body) = send_json(
            &app,
            Method::POST,
            "/api/pickups",
            Some(&token),
            Some(serde_json::json!({ "quantity": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Missing required fields.");

        let (status, _) = send_json(
            &app,
            Method::GET,
            "/api/pickups/not-an-id",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        bootstrap.teardown().await;
    }

    #[tokio::test]
    async fn test_driver_fulfils_pickup() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };
        let app = router(bootstrap.app_state.clone(), &test_config());
        let admin = bootstrap.user_token();

        let (user, _) = register(&app, "user@test.com", "user").await;
        let (driver, driver_id) = register(&app, "driver@test.com", "driver").await;

        let (_, created) = send_json(
            &app,
            Method::POST,
            "/api/pickups",
            Some(&user),
            Some(pickup_body(2.0)),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            &app,
            Method::PUT,
            &format!("/api/pickups/{}/assign", id),
            Some(&user),
            Some(serde_json::json!({ "driverId": driver_id })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, assigned) = send_json(
            &app,
            Method::PUT,
            &format!("/api/pickups/{}/assign", id),
            Some(&admin),
            Some(serde_json::json!({ "driverId": driver_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(assigned["status"], "scheduled");
        assert_eq!(assigned["assignedDriverId"], driver_id.as_str());
        assert_eq!(assigned["driver"], driver_id.as_str());

        let (status, started) = send_json(
            &app,
            Method::PUT,
            &format!("/api/pickups/{}/start", id),
            Some(&driver),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["status"], "in_progress");

        let (status, completed) = send_json(
            &app,
            Method::PUT,
            &format!("/api/pickups/{}/complete", id),
            Some(&driver),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["paymentStatus"], "paid");

        let (status, body) = send_json(
            &app,
            Method::PUT,
            &format!("/api/pickups/{}/cancel", id),
            Some(&user),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("completed"));

        bootstrap.teardown().await;
    }

    #[tokio::test]
    async fn test_expired_token_changes_nothing() {
        let Some(bootstrap) = bootstrap().await else {
            return;
        };
        let app = router(bootstrap.app_state.clone(), &test_config());

        let customer = bootstrap
            .derive("customer@test.com", "password", crate::api::v1::auth::UserRole::User)
            .await;
        let expired =
            generate_access_token_with_exp(&bootstrap.app_state.jwt_state, &customer.user_model, 0)
                .unwrap();

        let (status, _) = send_json(
            &app,
            Method::POST,
            "/api/pickups",
            Some(&expired),
            Some(pickup_body(5.0)),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let count = bootstrap
            .app_state
            .pickup_collection
            .count_documents(bson::doc! {}, None)
            .await
            .unwrap();
        assert_eq!(count, 0);

        bootstrap.teardown().await;
    }
}
