use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, RawQuery, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::any,
    Router,
};
use log::{info, warn};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_cookies::{CookieManagerLayer, Cookies};

use crate::auth::ClientMeta;
use crate::server::dispatcher::{ApiRequest, Dispatcher, Method};
use crate::Result;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Builds the axum router serving `<mount>/{collection}`.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let mount = dispatcher.config().mount_path.clone();
    Router::new()
        .route(&format!("{}/{{collection}}", mount), any(handle_collection))
        .fallback(move || {
            let usage = format!("docapi available at {}/<collection>", mount);
            async move { (StatusCode::NOT_FOUND, usage) }
        })
        .layer(CookieManagerLayer::new())
        .with_state(dispatcher)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, dispatcher: Arc<Dispatcher>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("docapi listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(dispatcher).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    })
    .unwrap_or_default()
}

fn client_meta(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientMeta {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    let forwarded = header("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|first| first.trim().to_string()))
        .filter(|v| !v.is_empty());
    ClientMeta {
        user_agent: header("user-agent"),
        address: forwarded.or_else(|| peer.map(|addr| addr.ip().to_string())),
    }
}

async fn handle_collection(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(collection): Path<String>,
    RawQuery(query): RawQuery,
    cookies: Cookies,
    request: Request,
) -> Response {
    let method = Method::parse(request.method().as_str());
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let client = client_meta(request.headers(), peer);

    let bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Could not read request body: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "unreadable body" }))).into_response();
        }
    };
    let body = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(body) => body,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid JSON body" }))).into_response();
            }
        }
    };

    let cookie_jar: HashMap<String, String> = cookies
        .list()
        .into_iter()
        .map(|c| (c.name().to_string(), c.value().to_string()))
        .collect();

    let api_request = ApiRequest {
        method,
        collection,
        query: parse_query(query.as_deref()),
        body,
        cookies: cookie_jar,
        client,
    };

    let response = dispatcher.handle(api_request).await;
    if let Some(cookie) = response.cookie {
        cookies.add(cookie);
    }
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_keeps_repeats() {
        let pairs = parse_query(Some("id=a&id=b&sort=title%3A-1&tag=x+y"));
        assert_eq!(
            pairs,
            vec![
                ("id".to_string(), "a".to_string()),
                ("id".to_string(), "b".to_string()),
                ("sort".to_string(), "title:-1".to_string()),
                ("tag".to_string(), "x y".to_string()),
            ]
        );
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_client_meta_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "curl/8".parse().unwrap());
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let meta = client_meta(&headers, Some(peer));
        assert_eq!(meta.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(meta.address.as_deref(), Some("10.0.0.1"));

        let meta = client_meta(&HeaderMap::new(), Some(peer));
        assert_eq!(meta.address.as_deref(), Some("127.0.0.1"));
    }
}
