use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use bytes::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use mockdb::{
    catalog::mock_key,
    config::{NetworkConfig, SharedNetworkConfig},
    connection::{ConnectionManager, StorageLocation},
    intercept::{BYPASS_HEADER, MockClient, SOURCE_HEADER, handler, json_response},
    schema::Collection,
    services::MockServices,
    transport::Transport,
};
use serde_json::{Value, json};

const API: &str = "http://localhost:3000/api";

/// Stands in for the real network: remembers what it was sent and answers
/// every request with the same canned response.
#[derive(Debug, Clone, Default)]
struct FakeTransport {
    sent: Arc<Mutex<Vec<Request<Bytes>>>>,
}

impl FakeTransport {
    fn sent(&self) -> Vec<(Method, String, Option<String>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|req| {
                (
                    req.method().clone(),
                    req.uri().to_string(),
                    req.headers()
                        .get(BYPASS_HEADER)
                        .map(|value| value.to_str().unwrap().to_owned()),
                )
            })
            .collect()
    }
}

impl Transport for FakeTransport {
    async fn send(&self, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        self.sent.lock().unwrap().push(request);
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("date", "Mon, 01 Jan 2024 00:00:00 GMT")
            .body(Bytes::from_static(br#"{"live":true}"#))
            .unwrap())
    }
}

fn network(config: NetworkConfig) -> SharedNetworkConfig {
    Arc::new(RwLock::new(config))
}

fn client_with(config: NetworkConfig) -> (MockClient<FakeTransport>, FakeTransport) {
    let transport = FakeTransport::default();
    let services = MockServices::new(Arc::new(ConnectionManager::in_memory()), network(config));
    (MockClient::new(services, transport.clone()), transport)
}

fn client() -> (MockClient<FakeTransport>, FakeTransport) {
    client_with(NetworkConfig::default())
}

fn request(method: Method, path: &str, body: Option<Value>) -> Request<Bytes> {
    let body = body.map_or_else(Bytes::new, |body| Bytes::from(body.to_string()));
    Request::builder()
        .method(method)
        .uri(format!("{API}{path}"))
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

fn json_body(response: &Response<Bytes>) -> Value {
    serde_json::from_slice(response.body()).unwrap()
}

#[tokio::test]
async fn crud_routes_read_and_write_the_store() {
    let (client, transport) = client();

    let created = client
        .send(request(
            Method::POST,
            "/users",
            Some(json!({"id": "1", "firstName": "A"})),
        ))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    assert_eq!(created.headers()[SOURCE_HEADER], "route");

    let duplicate = client
        .send(request(Method::POST, "/users", Some(json!({"id": "1"}))))
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    assert!(json_body(&duplicate)["error"]
        .as_str()
        .unwrap()
        .contains("already exists"));

    let fetched = client
        .send(request(Method::GET, "/users/1", None))
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    assert_eq!(json_body(&fetched), json!({"id": "1", "firstName": "A"}));

    let listed = client.send(request(Method::GET, "/users", None)).await.unwrap();
    assert_eq!(json_body(&listed), json!([{"id": "1", "firstName": "A"}]));

    let deleted = client
        .send(request(Method::DELETE, "/users/1", None))
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    let missing = client
        .send(request(Method::GET, "/users/1", None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn post_without_id_generates_one() {
    let (client, _) = client();

    let created = client
        .send(request(Method::POST, "/media-folders", Some(json!({"name": "Banners"}))))
        .await
        .unwrap();

    assert_eq!(created.status(), StatusCode::CREATED);
    let id = json_body(&created)["id"].as_str().unwrap().to_owned();
    assert!(!id.is_empty());
    assert!(client
        .services()
        .store
        .exists(Collection::MediaFolders, &id)
        .await
        .unwrap());
}

#[tokio::test]
async fn patch_updates_and_removes_nested_values() {
    let (client, _) = client();
    client
        .services()
        .store
        .add(
            Collection::Nudges,
            json!({"id": "n1", "ageRange": {"min": 18, "max": 65}, "tags": ["a", "b"]}),
        )
        .await
        .unwrap();

    let updated = client
        .send(request(
            Method::PATCH,
            "/nudges/n1",
            Some(json!({"path": ["ageRange", "min"], "value": 21})),
        ))
        .await
        .unwrap();
    assert_eq!(updated.status(), StatusCode::OK);

    let spliced = client
        .send(request(
            Method::PATCH,
            "/nudges/n1",
            Some(json!({"path": ["tags", 0]})),
        ))
        .await
        .unwrap();
    assert_eq!(
        json_body(&spliced),
        json!({"id": "n1", "ageRange": {"min": 21, "max": 65}, "tags": ["b"]})
    );

    let bad_path = client
        .send(request(
            Method::PATCH,
            "/nudges/n1",
            Some(json!({"path": ["tags", 9], "value": "z"})),
        ))
        .await
        .unwrap();
    assert_eq!(bad_path.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn put_requires_an_existing_record() {
    let (client, _) = client();

    let missing = client
        .send(request(Method::PUT, "/collections/c1", Some(json!({"name": "Spring"}))))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    client
        .services()
        .store
        .add(Collection::Collections, json!({"id": "c1", "name": "Winter"}))
        .await
        .unwrap();
    let replaced = client
        .send(request(Method::PUT, "/collections/c1", Some(json!({"name": "Spring"}))))
        .await
        .unwrap();
    assert_eq!(replaced.status(), StatusCode::OK);
    assert_eq!(json_body(&replaced), json!({"id": "c1", "name": "Spring"}));

    let mismatched = client
        .send(request(Method::PUT, "/collections/c1", Some(json!({"id": "c2"}))))
        .await
        .unwrap();
    assert_eq!(mismatched.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn other_origins_and_bypassed_requests_reach_the_network() {
    let (client, transport) = client();

    let foreign = Request::builder()
        .uri("https://cdn.example.com/api/users")
        .body(Bytes::new())
        .unwrap();
    let response = client.send(foreign).await.unwrap();
    assert_eq!(json_body(&response), json!({"live": true}));

    let mut bypassed = request(Method::GET, "/users", None);
    bypassed
        .headers_mut()
        .insert(BYPASS_HEADER, "1".parse().unwrap());
    let response = client.send(bypassed).await.unwrap();
    assert_eq!(json_body(&response), json!({"live": true}));

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, "https://cdn.example.com/api/users");
    assert_eq!(sent[1].1, format!("{API}/users"));
    assert_eq!(sent[1].2, None, "bypass header is not forwarded");
}

#[tokio::test]
async fn mock_data_switch_is_read_on_every_request() {
    let (client, transport) = client();

    client
        .services()
        .network()
        .write()
        .unwrap()
        .use_mock_data = false;
    let response = client.send(request(Method::GET, "/users", None)).await.unwrap();
    assert_eq!(json_body(&response), json!({"live": true}));

    client.services().network().write().unwrap().use_mock_data = true;
    let response = client.send(request(Method::GET, "/users", None)).await.unwrap();
    assert_eq!(json_body(&response), json!([]));

    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn route_traffic_is_logged_but_admin_traffic_is_not() {
    let (client, _) = client();

    client.send(request(Method::GET, "/users", None)).await.unwrap();
    client
        .send(request(Method::GET, "/users/404", None))
        .await
        .unwrap();
    client
        .send(request(Method::GET, "/_mock/backup", None))
        .await
        .unwrap();

    let log = client.services().recorder.list().await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].operation.status, Some(200));
    assert_eq!(log[1].operation.status, Some(404));
}

#[tokio::test]
async fn unmatched_requests_are_captured_then_replayed_once_approved() {
    let (client, transport) = client_with(NetworkConfig {
        capture_responses: true,
        ..NetworkConfig::default()
    });

    let live = client
        .send(request(Method::GET, "/reports/weekly", None))
        .await
        .unwrap();
    assert_eq!(json_body(&live), json!({"live": true}));

    let key = mock_key("GET", "/api/reports/weekly", None);
    let pending = client
        .send(request(Method::GET, "/_mock/responses?pending=true", None))
        .await
        .unwrap();
    assert_eq!(json_body(&pending)[0]["key"], json!(key));

    let reviewed = client
        .send(request(
            Method::POST,
            &format!("/_mock/responses/{key}/review"),
            Some(json!({"approved": true})),
        ))
        .await
        .unwrap();
    assert_eq!(reviewed.status(), StatusCode::OK);
    assert_eq!(json_body(&reviewed)["metadata"]["approved"], json!(true));

    let replayed = client
        .send(request(Method::GET, "/reports/weekly", None))
        .await
        .unwrap();
    assert_eq!(replayed.headers()[SOURCE_HEADER], "catalog");
    assert_eq!(json_body(&replayed), json!({"live": true}));
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn admin_reset_and_backup_round_trip() {
    let (client, _) = client();
    let seed = json!({"users": [{"id": "1"}], "nudges": [{"id": "n1", "title": "Hi"}]});

    let reset = client
        .send(request(Method::POST, "/_mock/reset", Some(seed.clone())))
        .await
        .unwrap();
    assert_eq!(json_body(&reset)["initialized"], json!(true));

    let exported = client
        .send(request(Method::GET, "/_mock/backup", None))
        .await
        .unwrap();
    let exported = json_body(&exported);
    assert_eq!(exported["users"], seed["users"]);
    assert_eq!(exported["nudges"], seed["nudges"]);
    assert_eq!(exported["media"], json!([]));

    let emptied = client
        .send(request(Method::POST, "/_mock/reset", None))
        .await
        .unwrap();
    assert_eq!(
        json_body(&emptied),
        json!({"initialized": false, "imported": null})
    );
    let users = client.send(request(Method::GET, "/users", None)).await.unwrap();
    assert_eq!(json_body(&users), json!([]));
}

#[tokio::test]
async fn encoded_query_values_select_the_full_export() {
    let (client, _) = client();
    client.send(request(Method::GET, "/users", None)).await.unwrap();

    let exported = client
        .send(request(Method::GET, "/_mock/backup?scope=a%6Cl", None))
        .await
        .unwrap();

    let exported = json_body(&exported);
    assert_eq!(exported["network"].as_array().map(Vec::len), Some(1));
    assert!(exported.get("mockResponses").is_some());
}

#[tokio::test]
async fn custom_routes_match_in_registration_order() {
    let services = MockServices::new(
        Arc::new(ConnectionManager::in_memory()),
        network(NetworkConfig::default()),
    );
    let mut client = MockClient::without_routes(services, FakeTransport::default());
    client
        .route(
            Method::GET,
            "/reports/latest",
            handler(|_ctx| async { json_response(StatusCode::OK, &json!({"report": "latest"})) }),
        )
        .route(
            Method::GET,
            "/reports/:id",
            handler(|ctx| async move {
                let id = ctx.param("id")?.to_owned();
                json_response(StatusCode::OK, &json!({"report": id}))
            }),
        );

    let latest = client
        .send(request(Method::GET, "/reports/latest", None))
        .await
        .unwrap();
    assert_eq!(json_body(&latest), json!({"report": "latest"}));

    let by_id = client
        .send(request(Method::GET, "/reports/7/", None))
        .await
        .unwrap();
    assert_eq!(json_body(&by_id), json!({"report": "7"}));

    let users = client.send(request(Method::GET, "/users", None)).await.unwrap();
    assert_eq!(users.headers().get(SOURCE_HEADER), None);
}

#[tokio::test]
async fn unavailable_store_yields_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file, not a directory").unwrap();
    let manager = ConnectionManager::new(
        StorageLocation::File(blocker.join("console.db")),
        Duration::from_millis(250),
    );
    let services = MockServices::new(Arc::new(manager), network(NetworkConfig::default()));
    let client = MockClient::new(services, FakeTransport::default());

    let response = client.send(request(Method::GET, "/users", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(json_body(&response)["error"]
        .as_str()
        .unwrap()
        .contains("unavailable"));
}
