pub mod providers;
pub mod servers;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/providers", get(providers::list_providers))
        // Server lifecycle
        .route(
            "/providers/{provider}/servers",
            post(servers::create_server).get(servers::list_servers),
        )
        .route(
            "/providers/{provider}/servers/{id}",
            delete(servers::delete_server),
        )
        .route(
            "/providers/{provider}/servers/{id}/status",
            post(servers::server_status),
        )
        .route(
            "/providers/{provider}/servers/{id}/update",
            post(servers::update_server),
        )
        .route(
            "/providers/{provider}/servers/{id}/plugins",
            post(servers::upload_plugin),
        )
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(providers::health))
        .merge(authed)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use mf_infra::id::ServerId;
    use mf_infra::tags::TagSet;
    use mf_infra::template::{BootScriptRenderer, CloudInitRenderer};
    use mf_infra::types::{ServerArgs, ServerInfo};
    use mf_infra::{Automation, Error, ProviderName, ProviderRegistry, Result};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::api_router;
    use crate::config::AppConfig;
    use crate::state::AppState;

    const KEY: &str = "test-key";

    #[derive(Default)]
    struct MemoryBackend {
        servers: Mutex<HashMap<String, ServerInfo>>,
    }

    #[async_trait]
    impl Automation for MemoryBackend {
        async fn create_server(&self, args: &ServerArgs) -> Result<ServerInfo> {
            let info = ServerInfo {
                id: ServerId::new(format!("{}-1", args.descriptor.name))?,
                name: args.descriptor.name.clone(),
                region: args.descriptor.region.clone(),
                public_ip: Some("192.0.2.10".into()),
                tags: TagSet::for_server(&args.descriptor).flatten(),
            };
            self.servers
                .lock()
                .unwrap()
                .insert(info.id.to_string(), info.clone());
            Ok(info)
        }

        async fn get_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<ServerInfo> {
            self.servers
                .lock()
                .unwrap()
                .get(&id.to_string())
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("server {id}")))
        }

        async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
            Ok(self.servers.lock().unwrap().values().cloned().collect())
        }

        async fn delete_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<()> {
            self.servers.lock().unwrap().remove(&id.to_string());
            Ok(())
        }

        fn name(&self) -> ProviderName {
            ProviderName::Hetzner
        }

        fn ssh_user(&self) -> &str {
            "root"
        }

        fn renderer(&self) -> &dyn BootScriptRenderer {
            &CloudInitRenderer
        }
    }

    fn app() -> axum::Router {
        let backend: Arc<dyn Automation> = Arc::new(MemoryBackend::default());
        api_router(AppState {
            providers: ProviderRegistry::from_providers([backend]),
            config: AppConfig {
                listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                control_plane_api_key: KEY.into(),
                default_timeout: None,
            },
        })
    }

    fn body(name: &str) -> Value {
        json!({
            "descriptor": {
                "name": name,
                "edition": "papermc",
                "size": "cx22",
                "region": "fsn1",
                "ssh": { "public_key": "ssh-ed25519 AAAAC3Nz test@host" },
            },
            "ssh_private_key_path": "/tmp/id_ed25519",
        })
    }

    fn request(method: &str, uri: &str, payload: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"));
        match payload {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let resp = app()
            .oneshot(
                Request::get("/providers")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn lists_configured_providers() {
        let resp = app()
            .oneshot(request("GET", "/providers", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            json_body(resp).await,
            json!([{ "name": "hetzner", "full_name": "Hetzner Cloud" }])
        );
    }

    #[tokio::test]
    async fn unknown_and_unconfigured_providers_are_not_found() {
        let resp = app()
            .oneshot(request("GET", "/providers/azure/servers", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app()
            .oneshot(request("GET", "/providers/aws/servers", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_then_delete() {
        let app = app();

        let resp = app
            .clone()
            .oneshot(request("POST", "/providers/hetzner/servers", Some(body("lobby"))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        assert_eq!(created["id"], "lobby-1");
        assert_eq!(created["tags"], "Name=lobby,mcfleet=true,papermc=true");

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                "/providers/hetzner/servers/lobby-1/status",
                Some(body("lobby")),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["public_ip"], "192.0.2.10");

        let resp = app
            .clone()
            .oneshot(request(
                "DELETE",
                "/providers/hetzner/servers/lobby-1",
                Some(body("lobby")),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .oneshot(request("GET", "/providers/hetzner/servers", None))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await, json!([]));
    }

    #[tokio::test]
    async fn invalid_names_are_bad_requests() {
        let resp = app()
            .oneshot(request(
                "POST",
                "/providers/hetzner/servers",
                Some(body("Bad_Name")),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err = json_body(resp).await;
        assert_eq!(err["phase"], "create");
        assert!(err["error"].as_str().unwrap().contains("Bad_Name"));
    }

    #[tokio::test]
    async fn status_of_unknown_server_is_not_found() {
        let resp = app()
            .oneshot(request(
                "POST",
                "/providers/hetzner/servers/ghost/status",
                Some(body("lobby")),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["phase"], "get");
    }
}
