//! Built-in routes: CRUD for every persisted collection plus `/_mock` admin
//! endpoints for backups, resets, capture review and the network log.

use hyper::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    backup::{BackupSnapshot, ExportScope},
    error::StoreError,
    intercept::{HandlerContext, HandlerError, HandlerResult, MockClient, handler, json_response},
    path::{PathSegment, parse_path},
    schema::Collection,
    store::now_unix_ms,
    transport::Transport,
};

/// URL segment each persisted collection is served under.
pub fn mount_path(collection: Collection) -> &'static str {
    match collection {
        Collection::Nudges => "/nudges",
        Collection::Collections => "/collections",
        Collection::Media => "/media",
        Collection::MediaFolders => "/media-folders",
        Collection::Users => "/users",
        Collection::Errors => "/errors",
        Collection::Network => "/network",
        Collection::MockResponses => "/mock-responses",
    }
}

pub(crate) fn register_defaults<T: Transport>(client: &mut MockClient<T>) {
    client
        .admin_route(Method::GET, "/_mock/backup", handler(export_backup))
        .admin_route(Method::POST, "/_mock/backup", handler(import_backup))
        .admin_route(Method::POST, "/_mock/reset", handler(reset_store))
        .admin_route(Method::GET, "/_mock/responses", handler(list_captures))
        .admin_route(
            Method::POST,
            "/_mock/responses/:key/review",
            handler(review_capture),
        )
        .admin_route(Method::GET, "/_mock/network", handler(list_network_log))
        .admin_route(Method::DELETE, "/_mock/network", handler(clear_network_log));

    for collection in Collection::persisted() {
        let base = mount_path(collection);
        let item = format!("{base}/:id");
        client
            .route(
                Method::GET,
                base,
                handler(move |ctx| list_records(ctx, collection)),
            )
            .route(
                Method::POST,
                base,
                handler(move |ctx| create_record(ctx, collection)),
            )
            .route(
                Method::GET,
                &item,
                handler(move |ctx| get_record(ctx, collection)),
            )
            .route(
                Method::PUT,
                &item,
                handler(move |ctx| replace_record(ctx, collection)),
            )
            .route(
                Method::PATCH,
                &item,
                handler(move |ctx| patch_record(ctx, collection)),
            )
            .route(
                Method::DELETE,
                &item,
                handler(move |ctx| delete_record(ctx, collection)),
            );
    }
}

async fn list_records(ctx: HandlerContext, collection: Collection) -> HandlerResult {
    let records = ctx.services.store.get_all(collection).await?;
    json_response(StatusCode::OK, &records)
}

async fn get_record(ctx: HandlerContext, collection: Collection) -> HandlerResult {
    let id = ctx.param("id")?;
    let record = ctx
        .services
        .store
        .get(collection, id)
        .await?
        .ok_or_else(|| not_found(collection, id))?;
    json_response(StatusCode::OK, &record)
}

async fn create_record(ctx: HandlerContext, collection: Collection) -> HandlerResult {
    let mut document = object_body(&ctx)?;
    let key_path = collection.key_path();
    if document.get(key_path).is_none_or(Value::is_null) {
        document.insert(key_path.to_owned(), Value::String(generate_id()));
    }
    if collection.has_timestamp_index() && !document.contains_key("timestamp") {
        document.insert("timestamp".to_owned(), Value::from(now_unix_ms()));
    }

    let stored = ctx
        .services
        .store
        .add(collection, Value::Object(document))
        .await?;
    json_response(StatusCode::CREATED, &stored)
}

async fn replace_record(ctx: HandlerContext, collection: Collection) -> HandlerResult {
    let id = ctx.param("id")?;
    let mut document = object_body(&ctx)?;
    let key_path = collection.key_path();
    match document.get(key_path) {
        None => {
            document.insert(key_path.to_owned(), Value::String(id.to_owned()));
        }
        Some(Value::String(body_id)) if body_id == id => {}
        Some(_) => {
            return Err(HandlerError::BadRequest(format!(
                "body `{key_path}` does not match `{id}` in the path"
            )));
        }
    }

    let store = &ctx.services.store;
    if !store.exists(collection, id).await? {
        return Err(not_found(collection, id));
    }
    let stored = store.put(collection, Value::Object(document)).await?;
    json_response(StatusCode::OK, &stored)
}

/// Body of a `PATCH /<collection>/:id` request. Leaving out `value`
/// removes the addressed field.
#[derive(Debug, Deserialize)]
struct PatchBody {
    path: Value,
    #[serde(default, deserialize_with = "present")]
    value: Option<Value>,
}

/// Distinguishes `"value": null` (set to null) from an absent `value`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

async fn patch_record(ctx: HandlerContext, collection: Collection) -> HandlerResult {
    let id = ctx.param("id")?;
    let body = ctx
        .json_body()?
        .ok_or_else(|| HandlerError::BadRequest("PATCH requires a JSON body".to_owned()))?;
    let patch: PatchBody = serde_json::from_value(body)
        .map_err(|err| HandlerError::BadRequest(format!("invalid patch body: {err}")))?;

    let mut path = vec![PathSegment::Key(id.to_owned())];
    path.extend(parse_path(&patch.path).map_err(StoreError::from)?);

    let updated = ctx
        .services
        .store
        .update_by_path(collection, &path, patch.value)
        .await?;
    json_response(StatusCode::OK, &updated)
}

async fn delete_record(ctx: HandlerContext, collection: Collection) -> HandlerResult {
    let id = ctx.param("id")?;
    ctx.services.store.delete(collection, id).await?;
    json_response(StatusCode::OK, &json!({ "deleted": id }))
}

async fn export_backup(ctx: HandlerContext) -> HandlerResult {
    let scope = if ctx.query("scope").as_deref() == Some("all") {
        ExportScope::All
    } else {
        ExportScope::Persisted
    };
    let snapshot = ctx.services.backup.export_scope(scope).await?;
    json_response(StatusCode::OK, &snapshot)
}

async fn import_backup(ctx: HandlerContext) -> HandlerResult {
    let snapshot = snapshot_body(&ctx)?
        .ok_or_else(|| HandlerError::BadRequest("import requires a snapshot body".to_owned()))?;
    let summary = ctx.services.backup.import(&snapshot).await?;
    json_response(StatusCode::OK, &summary)
}

async fn reset_store(ctx: HandlerContext) -> HandlerResult {
    let seed = snapshot_body(&ctx)?;
    let summary = ctx.services.backup.reset_with_seed(seed.as_ref()).await?;
    let initialized = ctx.services.backup.is_initialized().await?;
    json_response(
        StatusCode::OK,
        &json!({ "initialized": initialized, "imported": summary }),
    )
}

async fn list_captures(ctx: HandlerContext) -> HandlerResult {
    let catalog = &ctx.services.catalog;
    let entries = if ctx.query("pending").as_deref() == Some("true") {
        catalog.pending().await?
    } else {
        catalog.list().await?
    };
    json_response(StatusCode::OK, &entries)
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    approved: bool,
}

async fn review_capture(ctx: HandlerContext) -> HandlerResult {
    let key = ctx.param("key")?;
    let body = ctx
        .json_body()?
        .ok_or_else(|| HandlerError::BadRequest("review requires `approved`".to_owned()))?;
    let review: ReviewBody = serde_json::from_value(body)
        .map_err(|err| HandlerError::BadRequest(format!("invalid review body: {err}")))?;
    let entry = ctx.services.catalog.review(key, review.approved).await?;
    json_response(StatusCode::OK, &entry)
}

async fn list_network_log(ctx: HandlerContext) -> HandlerResult {
    let recorder = &ctx.services.recorder;
    let entries = match ctx.query("limit") {
        Some(raw) => {
            let limit = raw
                .parse()
                .map_err(|_| HandlerError::BadRequest(format!("invalid limit `{raw}`")))?;
            recorder.recent(limit).await?
        }
        None => recorder.list().await?,
    };
    json_response(StatusCode::OK, &entries)
}

async fn clear_network_log(ctx: HandlerContext) -> HandlerResult {
    let removed = ctx.services.recorder.clear().await?;
    json_response(StatusCode::OK, &json!({ "removed": removed }))
}

fn object_body(ctx: &HandlerContext) -> Result<serde_json::Map<String, Value>, HandlerError> {
    match ctx.json_body()? {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(HandlerError::BadRequest(
            "request body must be a JSON object".to_owned(),
        )),
    }
}

fn snapshot_body(ctx: &HandlerContext) -> Result<Option<BackupSnapshot>, HandlerError> {
    ctx.json_body()?
        .map(|body| {
            serde_json::from_value(body)
                .map_err(|err| HandlerError::BadRequest(format!("invalid snapshot: {err}")))
        })
        .transpose()
}

fn not_found(collection: Collection, id: &str) -> HandlerError {
    HandlerError::Store(StoreError::NotFound {
        collection,
        id: id.to_owned(),
    })
}

fn generate_id() -> String {
    format!("{}-{:08x}", now_unix_ms(), rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::PatchBody;

    #[test]
    fn patch_body_distinguishes_null_from_missing_value() {
        let set_null: PatchBody =
            serde_json::from_value(json!({"path": ["title"], "value": null})).unwrap();
        assert_eq!(set_null.value, Some(serde_json::Value::Null));

        let remove: PatchBody = serde_json::from_value(json!({"path": ["title"]})).unwrap();
        assert_eq!(remove.value, None);
    }
}
