use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use warden::authz::web::AuthzApi;
use warden::authz::PlannerMode;

use super::engine::TestEngine;

/// In-process API server on an ephemeral port
pub struct TestServer {
    base_url: String,
    handle: JoinHandle<()>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub async fn start(engine: &TestEngine, policies_dir: Option<PathBuf>) -> Self {
        let api = AuthzApi {
            engine: engine.engine.clone(),
            planner: engine.planner(PlannerMode::Strict),
            policies_dir,
            load_timeout: Duration::from_secs(5),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Failed to read local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, warden::web::app(api))
                .await
                .expect("Test server failed");
        });
        Self {
            base_url: format!("http://{addr}"),
            handle,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
