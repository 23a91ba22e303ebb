//! Shared helpers: a scripted compiler and an in-process LSP harness.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tower::{Service, ServiceExt};
use tower_lsp::jsonrpc::Request;
use tower_lsp::LspService;

use toitlsp::{Backend, ServerSettings};

/// Frame-emitting shell prelude for scripted compilers.
pub const EMIT_FRAME: &str = r#"
emit_frame() {
  local sign="$1"
  local payload="$2"
  local len=${#payload}
  local val=$len
  if [ "$sign" -lt 0 ]; then val=$(( 4294967296 - len )); fi
  printf "$(printf '\\x%02x\\x%02x\\x%02x\\x%02x' \
    $(( val & 255 )) $(( (val >> 8) & 255 )) $(( (val >> 16) & 255 )) $(( (val >> 24) & 255 )))"
  printf '%s' "$payload"
}
"#;

/// Writes an executable compiler stand-in into `dir`.
#[cfg(unix)]
pub fn write_compiler_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let script = format!("#!/usr/bin/env bash\nset -u\n{EMIT_FRAME}\n{body}\n");
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

/// An initialized in-process server plus the messages it sent.
pub struct TestServer {
    service: LspService<Backend>,
    /// `(method, params)` of every message sent to the editor.
    pub sent: Arc<Mutex<Vec<(String, Value)>>>,
}

impl TestServer {
    /// Builds the service, drains its client socket into `sent`, and
    /// runs the `initialize`/`initialized` handshake.
    pub async fn start(settings: ServerSettings) -> TestServer {
        let (service, socket) =
            LspService::build(move |client| Backend::new(client, settings)).finish();
        let sent: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        let sink = sent.clone();
        tokio::spawn(async move {
            let mut socket = socket;
            while let Some(message) = socket.next().await {
                let value = serde_json::to_value(&message).unwrap_or(Value::Null);
                let method = value
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                sink.lock()
                    .unwrap()
                    .push((method, value.get("params").cloned().unwrap_or(Value::Null)));
            }
        });

        let mut server = TestServer { service, sent };
        server
            .request(1, "initialize", json!({"capabilities": {}}))
            .await;
        server.notify("initialized", json!({})).await;
        server
    }

    pub async fn request(&mut self, id: i64, method: &str, params: Value) -> Option<Value> {
        let request = Request::build(method.to_string())
            .id(id)
            .params(params)
            .finish();
        let service = self.service.ready().await.expect("service not ready");
        let response = service.call(request).await.expect("request failed");
        response.and_then(|r| serde_json::to_value(r).ok())
    }

    pub async fn request_no_params(&mut self, id: i64, method: &str) -> Option<Value> {
        let request = Request::build(method.to_string()).id(id).finish();
        let service = self.service.ready().await.expect("service not ready");
        let response = service.call(request).await.expect("request failed");
        response.and_then(|r| serde_json::to_value(r).ok())
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        let request = Request::build(method.to_string()).params(params).finish();
        let service = self.service.ready().await.expect("service not ready");
        let _ = service.call(request).await.expect("notification failed");
    }

    /// Params of every sent message with the given method, after letting
    /// the socket drain.
    pub async fn sent_with_method(&self, method: &str) -> Vec<Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}
