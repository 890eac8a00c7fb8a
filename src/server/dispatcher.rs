use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info};
use serde_json::{json, Value};
use tower_cookies::Cookie;

use crate::auth::cookie::{decode_session, CookieSettings};
use crate::auth::credentials::{EMAIL_FIELD, PASSWORD_FIELD};
use crate::auth::{ClientMeta, Credentials, Sessions, User};
use crate::collections::{is_singleton, Collections, BODY_ID_FIELD};
use crate::config::Config;
use crate::engine::StoreHandle;
use crate::policy::{read_filter, write_filter};
use crate::{Document, DocumentStore, Error, Result};

/// Collection name routed to the account and session endpoints.
pub const AUTH_COLLECTION: &str = "auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Other,
}

impl Method {
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            _ => Method::Other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// What the dispatcher needs to know about an inbound request.
///
/// Host adapters (see [`crate::server::http`]) build one of these per request.
#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub method: Method,
    pub collection: String,
    /// Decoded query pairs in their original order. Keys may repeat.
    pub query: Vec<(String, String)>,
    /// Parsed JSON body, `Null` when the request had none.
    pub body: Value,
    pub cookies: HashMap<String, String>,
    pub client: ClientMeta,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Cookie the host must set on the response.
    pub cookie: Option<Cookie<'static>>,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body, cookie: None }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
            cookie: None,
        }
    }

    fn with_cookie(mut self, cookie: Cookie<'static>) -> Self {
        self.cookie = Some(cookie);
        self
    }
}

enum IdParam {
    None,
    One(String),
    Many(Vec<String>),
}

/// The parts of a request the collection handlers act on.
struct Params {
    id: IdParam,
    sort: Option<String>,
    filters: Vec<(String, String)>,
    body: Value,
}

impl Params {
    fn from_request(request: &ApiRequest) -> Self {
        let mut ids = Vec::new();
        let mut bracketed = false;
        let mut sort = None;
        let mut filters = Vec::new();

        for (key, value) in &request.query {
            match key.as_str() {
                "id" => ids.push(value.clone()),
                "id[]" => {
                    bracketed = true;
                    ids.push(value.clone());
                }
                "sort" => sort = Some(value.clone()),
                "collection" => {}
                _ => {
                    filters.retain(|(k, _): &(String, String)| k != key);
                    filters.push((key.clone(), value.clone()));
                }
            }
        }

        let mut body = request.body.clone();
        let body_id = match &mut body {
            Value::Object(map) => map.remove(BODY_ID_FIELD).and_then(|v| v.as_str().map(str::to_string)),
            _ => None,
        };

        let id = if bracketed || ids.len() > 1 {
            IdParam::Many(ids)
        } else if let Some(id) = ids.pop().filter(|id| !id.is_empty()) {
            IdParam::One(id)
        } else if let Some(id) = body_id {
            IdParam::One(id)
        } else {
            IdParam::None
        };

        Self { id, sort, filters, body }
    }
}

/// Objects keyed exactly `"0"`..`"n-1"` are treated as arrays of length n.
fn dense_array_items(body: &Document) -> Option<Vec<Value>> {
    if body.is_empty() {
        return None;
    }
    (0..body.len()).map(|i| body.get(&i.to_string()).cloned()).collect()
}

fn into_documents(items: Vec<Value>) -> Result<Vec<Document>> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(doc) => Ok(doc),
            _ => Err(Error::InvalidInput("bulk items must be objects".to_string())),
        })
        .collect()
}

fn body_document(body: Value) -> Result<Document> {
    match body {
        Value::Object(doc) => Ok(doc),
        Value::Null => Ok(Document::new()),
        _ => Err(Error::InvalidInput("body must be a JSON object".to_string())),
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid collection name: {}", name)))
    }
}

fn unauthorized() -> ApiResponse {
    ApiResponse::error(403, "unauthorized")
}

fn document_or_empty(doc: Option<Document>) -> Value {
    Value::Object(doc.unwrap_or_default())
}

/// Maps requests onto the collection, credential and session components.
pub struct Dispatcher {
    store: Arc<StoreHandle>,
    config: Config,
    cookies: CookieSettings,
}

impl Dispatcher {
    pub fn new(store: Arc<StoreHandle>, config: Config) -> Self {
        let cookies = CookieSettings {
            name: config.cookie_name.clone(),
            path: config.mount_path.clone(),
            secure: config.secure_cookies,
            max_age: config.session_lifetime,
        };
        Self { store, config, cookies }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        &self.store
    }

    /// Handles one request. Always produces a response; failures are logged
    /// and reported with their status code.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let result = if request.collection == AUTH_COLLECTION {
            self.handle_auth(&request).await
        } else {
            self.handle_collection(&request).await
        };

        let response = match result {
            Ok(response) => response,
            Err(Error::Forbidden) if request.collection == AUTH_COLLECTION => unauthorized(),
            Err(e) => {
                let status = e.status_code();
                if status >= 500 {
                    error!("{} {} failed: {}", request.method, request.collection, e);
                } else {
                    debug!("{} {} rejected: {}", request.method, request.collection, e);
                }
                ApiResponse::error(status, e.to_string())
            }
        };
        debug!("{} {} -> {}", request.method, request.collection, response.status);
        response
    }

    fn sessions(&self, store: Arc<dyn DocumentStore>) -> Sessions {
        Sessions::new(store, self.config.session_lifetime)
    }

    async fn resolve_caller(&self, sessions: &Sessions, request: &ApiRequest) -> Result<Option<User>> {
        match request.cookies.get(&self.config.cookie_name).and_then(|v| decode_session(v)) {
            Some((session_id, token)) => sessions.resolve_session(&session_id, &token).await,
            None => Ok(None),
        }
    }

    async fn handle_collection(&self, request: &ApiRequest) -> Result<ApiResponse> {
        validate_collection_name(&request.collection)?;
        let collection = request.collection.as_str();

        let store = self.store.get().await?;
        let caller = self.resolve_caller(&self.sessions(store.clone()), request).await?;
        let caller_id = caller.as_ref().map(|user| user.id.as_str());

        let security = self.config.security;
        let collections = Collections::new(store, security);
        let params = Params::from_request(request);
        let singleton = is_singleton(collection);

        if request.method == Method::Get {
            let filter = read_filter(caller_id);
            let body = if singleton {
                document_or_empty(collections.find_one(collection, filter, None).await?)
            } else {
                match &params.id {
                    IdParam::One(id) => document_or_empty(collections.find_one(collection, filter, Some(id)).await?),
                    IdParam::Many(_) => {
                        return Err(Error::InvalidOperation("multiple ids are only supported by DELETE".to_string()))
                    }
                    IdParam::None => {
                        let docs = collections
                            .find_many(collection, filter, &params.filters, params.sort.as_deref())
                            .await?;
                        Value::Array(docs.into_iter().map(Value::Object).collect())
                    }
                }
            };
            return Ok(ApiResponse::ok(body));
        }

        if request.method == Method::Other {
            return Ok(ApiResponse::error(405, "method not allowed"));
        }

        if security.requires_auth_for_write() && caller_id.is_none() {
            return Ok(ApiResponse::error(403, "forbidden"));
        }
        let filter = write_filter(caller_id);

        match request.method {
            Method::Post => {
                if singleton {
                    return Err(Error::InvalidOperation("singleton, use PUT instead".to_string()));
                }
                let items = match &params.body {
                    Value::Array(items) => Some(items.clone()),
                    Value::Object(doc) => dense_array_items(doc),
                    _ => None,
                };
                match items {
                    Some(items) => {
                        let saved = collections.insert_many(collection, caller_id, into_documents(items)?).await?;
                        info!("Inserted {} documents into {}", saved.len(), collection);
                        Ok(ApiResponse::ok(Value::Array(saved.into_iter().map(Value::Object).collect())))
                    }
                    None => {
                        let saved = collections.insert_one(collection, caller_id, body_document(params.body)?).await?;
                        Ok(ApiResponse::ok(Value::Object(saved)))
                    }
                }
            }
            Method::Put => {
                let body = body_document(params.body)?;
                if singleton {
                    let saved = collections.upsert_singleton(collection, filter, caller_id, body).await?;
                    return Ok(ApiResponse::ok(Value::Object(saved)));
                }
                match params.id {
                    IdParam::One(id) => {
                        let updated = collections.update_by_id(collection, filter, &id, body).await?;
                        Ok(ApiResponse::ok(document_or_empty(updated)))
                    }
                    IdParam::Many(_) => Err(Error::InvalidOperation("PUT takes a single id".to_string())),
                    IdParam::None => Err(Error::InvalidInput("id is required".to_string())),
                }
            }
            Method::Delete => {
                if singleton {
                    return Err(Error::InvalidOperation("singleton collections cannot be deleted".to_string()));
                }
                match params.id {
                    IdParam::Many(ids) => {
                        let deleted = collections.delete_many(collection, filter, &ids).await?;
                        Ok(ApiResponse::ok(json!({ "deleted": deleted })))
                    }
                    IdParam::One(id) => {
                        let deleted = collections.delete_one(collection, filter, &id).await?;
                        Ok(ApiResponse::ok(json!({ "deleted": deleted == 1 })))
                    }
                    IdParam::None => Err(Error::InvalidInput("id is required".to_string())),
                }
            }
            Method::Get | Method::Other => Ok(ApiResponse::error(405, "method not allowed")),
        }
    }

    /// who-am-i (GET), signup or self-edit (POST), login (PUT), logout (DELETE).
    async fn handle_auth(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let store = self.store.get().await?;
        let sessions = self.sessions(store.clone());
        let credentials = Credentials::new(store, self.config.password_cost);
        let caller = self.resolve_caller(&sessions, request).await?;

        match request.method {
            Method::Get => match caller {
                Some(user) => Ok(ApiResponse::ok(serde_json::to_value(&user)?)),
                None => Ok(unauthorized()),
            },
            Method::Post => {
                let mut body = body_document(request.body.clone())?;
                let user = match caller {
                    Some(user) => credentials.edit_profile(&user.id, body).await?,
                    None => {
                        let email = take_string(&mut body, EMAIL_FIELD);
                        let password = take_string(&mut body, PASSWORD_FIELD);
                        credentials.sign_up(&email, &password, body).await?
                    }
                };
                Ok(ApiResponse::ok(serde_json::to_value(&user)?))
            }
            Method::Put => {
                let mut body = body_document(request.body.clone())?;
                let email = take_string(&mut body, EMAIL_FIELD);
                let password = take_string(&mut body, PASSWORD_FIELD);
                match credentials.verify_password(&email, &password).await? {
                    Some(user) => {
                        let (session_id, token) = sessions.create_session(&user.id, &request.client).await?;
                        info!("User {} logged in", user.id);
                        Ok(ApiResponse::ok(serde_json::to_value(&user)?).with_cookie(self.cookies.session(&session_id, &token)))
                    }
                    None => Ok(unauthorized()),
                }
            }
            Method::Delete => {
                let session = request.cookies.get(&self.config.cookie_name).and_then(|v| decode_session(v));
                let Some((session_id, _)) = session.filter(|_| caller.is_some()) else {
                    return Ok(unauthorized());
                };
                if sessions.destroy_session(&session_id).await? {
                    Ok(ApiResponse::ok(json!({})).with_cookie(self.cookies.cleared()))
                } else {
                    Ok(unauthorized())
                }
            }
            Method::Other => Ok(ApiResponse::error(405, "method not allowed")),
        }
    }
}

fn take_string(body: &mut Document, field: &str) -> String {
    match body.remove(field) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}
