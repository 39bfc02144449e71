use cloudsnap_core::{ObjectPatch, RESUMABLE_THRESHOLD, StoreClient};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> StoreClient {
    StoreClient::with_base_url(&server.uri(), "test-token").unwrap()
}

#[tokio::test]
async fn list_objects_follows_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/objects"))
        .and(query_param("parent", "root-1"))
        .and(query_param("profile", "myhost"))
        .and(query_param("pageToken", "page-2"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "objects": [
                {
                    "name": "b.txt/cafe",
                    "id": "obj-2",
                    "size": 20,
                    "trashed": false,
                    "contentType": "cloudsnap/data644",
                    "modifiedTime": "2024-01-02T00:00:00.000Z"
                }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/objects"))
        .and(query_param("parent", "root-1"))
        .and(query_param("profile", "myhost"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "objects": [
                {
                    "name": "a.txt/beef",
                    "id": "obj-1",
                    "size": 10,
                    "trashed": false,
                    "contentType": "cloudsnap/data644",
                    "modifiedTime": "2024-01-01T00:00:00.000Z"
                }
            ],
            "nextPageToken": "page-2"
        })))
        .mount(&server)
        .await;

    let objects = client_for(&server)
        .list_objects("root-1", "myhost")
        .await
        .unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].id, "obj-1");
    assert_eq!(objects[1].id, "obj-2");
    assert_eq!(objects[1].name, "b.txt/cafe");
}

#[tokio::test]
async fn small_upload_is_a_single_multipart_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/objects"))
        .and(query_param("uploadType", "multipart"))
        .and(body_string_contains("\"name\":\"a.txt/beef\""))
        .and(body_string_contains("\"parent\":\"root-1\""))
        .and(body_string_contains("payload-bytes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "obj-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let meta = ObjectPatch {
        name: "a.txt/beef".into(),
        parent: Some("root-1".into()),
        profile: Some("myhost".into()),
        trashed: None,
        modified_time: Some("2024-01-01T00:00:00.000Z".into()),
        content_type: "cloudsnap/data644".into(),
    };
    let id = client_for(&server)
        .upload(None, &meta, b"payload-bytes")
        .await
        .unwrap();
    assert_eq!(id, "obj-1");
}

#[tokio::test]
async fn update_patches_existing_object_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/v1/objects/obj-7"))
        .and(query_param("uploadType", "multipart"))
        .and(body_string_contains("\"trashed\":true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "obj-7"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let meta = ObjectPatch {
        name: "gone.txt/".into(),
        parent: None,
        profile: None,
        trashed: Some(true),
        modified_time: None,
        content_type: "cloudsnap/deleted".into(),
    };
    let id = client_for(&server)
        .upload(Some("obj-7"), &meta, b"")
        .await
        .unwrap();
    assert_eq!(id, "obj-7");
}

#[tokio::test]
async fn large_upload_uses_the_resumable_protocol() {
    let server = MockServer::start().await;
    let location = format!("{}/upload-session/42", server.uri());
    Mock::given(method("POST"))
        .and(path("/v1/objects"))
        .and(query_param("uploadType", "resumable"))
        .and(header("x-upload-content-type", "cloudsnap/data644"))
        .and(header(
            "x-upload-content-length",
            RESUMABLE_THRESHOLD.to_string().as_str(),
        ))
        .respond_with(ResponseTemplate::new(200).insert_header("location", location.as_str()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload-session/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "obj-big"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let meta = ObjectPatch {
        name: "big.bin/feed".into(),
        parent: Some("root-1".into()),
        profile: Some("myhost".into()),
        trashed: None,
        modified_time: Some("2024-01-01T00:00:00.000Z".into()),
        content_type: "cloudsnap/data644".into(),
    };
    let content = vec![0u8; RESUMABLE_THRESHOLD];
    let id = client_for(&server).upload(None, &meta, &content).await.unwrap();
    assert_eq!(id, "obj-big");
}

#[tokio::test]
async fn lists_revisions_of_an_object() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/objects/obj-1/revisions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "revisions": [
                {
                    "id": "rev-1",
                    "contentType": "cloudsnap/data644",
                    "modifiedTime": "2024-01-01T00:00:00.000Z"
                },
                {
                    "id": "rev-2",
                    "contentType": "cloudsnap/deleted",
                    "modifiedTime": "2024-02-01T00:00:00.000Z"
                }
            ]
        })))
        .mount(&server)
        .await;

    let revisions = client_for(&server).list_revisions("obj-1").await.unwrap();
    assert_eq!(revisions.len(), 2);
    assert_eq!(revisions[0].id, "rev-1");
    assert_eq!(revisions[1].content_type, "cloudsnap/deleted");
}

#[tokio::test]
async fn fetches_head_and_revision_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/objects/obj-1/content"))
        .and(query_param("revision", "rev-1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"old"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/objects/obj-1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"head"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert_eq!(client.get_content("obj-1", None).await.unwrap(), b"head");
    assert_eq!(
        client.get_content("obj-1", Some("rev-1")).await.unwrap(),
        b"old"
    );
}

#[tokio::test]
async fn quota_reports_free_space() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/quota"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "usedBytes": 750,
            "limitBytes": 1000,
            "trashBytes": 50
        })))
        .mount(&server)
        .await;

    let quota = client_for(&server).get_quota().await.unwrap();
    assert_eq!(quota.free_bytes(), 250);
    assert_eq!(quota.trash_bytes, 50);
}

#[tokio::test]
async fn api_errors_carry_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/quota"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client_for(&server).get_quota().await.unwrap_err();
    match err {
        cloudsnap_core::StoreError::Api { status, body } => {
            assert_eq!(status.as_u16(), 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error: {other}"),
    }
}
