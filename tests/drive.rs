mod common;

use axum::http::StatusCode;
use common::{Harness, PAYLOAD, TESTER1, TESTER2, TESTER10, connector_of};
use object_drive::{
    crypto::keys::{MasterKey, permission_is_valid},
    models::object::parse_object_id,
    services::aac::StandaloneAac,
};
use serde_json::{Value, json};

fn open_acm() -> Value {
    json!({"classif": "U", "share": {}})
}

fn group_acm() -> Value {
    json!({
        "classif": "U",
        "share": {"projects": {"DCTC": {"disp_nm": "DCTC", "groups": ["ODrive_G2"]}}}
    })
}

fn f_share(object: &Value) -> Vec<String> {
    object["acm"]["f_share"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn create_then_read_back() {
    let h = Harness::standalone().await;
    let created = h.create_file(TESTER1, open_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!created["changeToken"].as_str().unwrap().is_empty());
    assert_eq!(created["contentSize"], 64);

    let reply = h.get(TESTER1, &format!("/objects/{id}/stream")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], &PAYLOAD[..]);
    assert_eq!(reply.header("content-length"), Some("64"));
    assert_eq!(reply.header("content-type"), Some("text/plain"));
    assert_eq!(reply.header("accept-ranges"), Some("none"));
    assert_eq!(reply.header("content-disposition"), Some("inline; filename=f"));
}

#[tokio::test]
async fn range_read_returns_the_requested_slice() {
    let h = Harness::standalone().await;
    let created = h.create_file(TESTER1, open_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();

    let reply = h
        .get_with(TESTER1, &format!("/objects/{id}/stream"), &[("Range", "bytes=5-34")])
        .await;
    // ranged reads answer 206 with Content-Range, not 200 with the slice
    assert_eq!(reply.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(reply.body.len(), 30);
    assert_eq!(&reply.body[..], &PAYLOAD[5..35]);
    assert_eq!(reply.header("content-range"), Some("bytes 5-34/64"));
    assert_eq!(reply.header("content-length"), Some("30"));

    let tail = h
        .get_with(TESTER1, &format!("/objects/{id}/stream"), &[("Range", "bytes=60-")])
        .await;
    assert_eq!(&tail.body[..], b"89!@");

    let suffix = h
        .get_with(TESTER1, &format!("/objects/{id}/stream"), &[("Range", "bytes=-3")])
        .await;
    assert_eq!(suffix.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(&suffix.body[..], b"9!@");
    assert_eq!(suffix.header("content-range"), Some("bytes 61-63/64"));

    let bad = h
        .get_with(TESTER1, &format!("/objects/{id}/stream"), &[("Range", "bytes=64-")])
        .await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn matching_etag_is_not_modified() {
    let h = Harness::standalone().await;
    let created = h.create_file(TESTER1, open_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();
    let uri = format!("/objects/{id}/stream");

    let first = h.get(TESTER1, &uri).await;
    let etag = first.header("etag").unwrap().to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));

    let second = h.get_with(TESTER1, &uri, &[("If-None-Match", etag.as_str())]).await;
    assert_eq!(second.status, StatusCode::NOT_MODIFIED);
    assert!(second.body.is_empty());

    let stale = h.get_with(TESTER1, &uri, &[("If-None-Match", "\"nope\"")]).await;
    assert_eq!(stale.status, StatusCode::OK);
}

#[tokio::test]
async fn concurrent_updates_with_one_token() {
    let h = Harness::standalone().await;
    let created = h.create_file(TESTER1, open_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();
    let token = created["changeToken"].as_str().unwrap();
    let uri = format!("/objects/{id}/properties");

    let (a, b) = tokio::join!(
        h.json(TESTER1, "POST", &uri, json!({"changeToken": token, "name": "alpha"})),
        h.json(TESTER1, "POST", &uri, json!({"changeToken": token, "name": "beta"})),
    );
    let mut statuses = vec![a.status.as_u16(), b.status.as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 428]);

    let winner = if a.status == StatusCode::OK { a.json() } else { b.json() };
    let current = h.get(TESTER1, &uri).await.json();
    assert_eq!(current["name"], winner["name"]);
    assert_eq!(current["changeToken"], winner["changeToken"]);
    assert_eq!(current["changeCount"], 1);
}

#[tokio::test]
async fn share_and_unshare_keep_marking_in_step() {
    let aac = StandaloneAac::new().with_user_groups(TESTER1, &["dctc_odrive_g2"]);
    let h = Harness::new(aac).await;
    let created = h.create_file(TESTER1, group_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();
    let props = format!("/objects/{id}/properties");
    let shared = format!("/shared/{id}");
    let u10 = "cntesttester10oupeopleoudaeouchimeraou_s_governmentcus";

    assert_eq!(h.get(TESTER10, &props).await.status, StatusCode::FORBIDDEN);

    let reply = h
        .json(TESTER1, "POST", &shared, json!({"share": TESTER10, "allowRead": true}))
        .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", String::from_utf8_lossy(&reply.body));
    assert!(f_share(&reply.json()).contains(&u10.to_string()));
    assert_eq!(h.get(TESTER10, &props).await.status, StatusCode::OK);
    let stream = h.get(TESTER10, &format!("/objects/{id}/stream")).await;
    assert_eq!(&stream.body[..], &PAYLOAD[..]);

    let reply = h
        .json(TESTER1, "DELETE", &shared, json!({"share": TESTER10, "allowRead": true}))
        .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", String::from_utf8_lossy(&reply.body));
    let after = reply.json();
    assert!(!f_share(&after).contains(&u10.to_string()));
    assert!(f_share(&after).contains(&"dctc_odrive_g2".to_string()));
    assert_eq!(h.get(TESTER10, &props).await.status, StatusCode::FORBIDDEN);
    assert_eq!(h.get(TESTER1, &props).await.status, StatusCode::OK);
}

#[tokio::test]
async fn forged_grant_never_becomes_valid() {
    let h = Harness::standalone().await;
    let acm = json!({"classif": "U", "share": {"users": [TESTER1, TESTER2]}});
    let created = h.create_file(TESTER1, acm, PAYLOAD).await;
    let id = created["id"].as_str().unwrap();
    let object_id = parse_object_id(id).unwrap();
    let props = format!("/objects/{id}/properties");
    let shared = format!("/shared/{id}");
    assert_eq!(h.get(TESTER2, &props).await.status, StatusCode::OK);

    let tester2 = |p: &&object_drive::models::permission::PermissionRecord| {
        p.flat_grantee().contains("tester02")
    };
    let permissions = h.state.metadata.get_permissions(object_id).await.unwrap();
    let granted = permissions.iter().find(tester2).unwrap();
    assert!(!granted.allow_share);
    sqlx::query("UPDATE object_permissions SET allow_share = 1, allow_delete = 1 WHERE id = ?")
        .bind(granted.id)
        .execute(&*h.state.metadata.db)
        .await
        .unwrap();

    // a grant that no longer matches its mac counts for nothing
    let escalate = json!({"share": TESTER10, "allowRead": true});
    assert_eq!(h.json(TESTER2, "POST", &shared, escalate.clone()).await.status, StatusCode::FORBIDDEN);
    assert_eq!(h.get(TESTER2, &props).await.status, StatusCode::FORBIDDEN);
    assert_eq!(h.get(TESTER2, &format!("/objects/{id}/stream")).await.status, StatusCode::FORBIDDEN);

    let reply = h
        .json(TESTER1, "POST", &shared, json!({"share": TESTER10, "allowRead": true}))
        .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", String::from_utf8_lossy(&reply.body));

    let master = MasterKey::new("otterpaws").unwrap();
    let permissions = h.state.metadata.get_permissions(object_id).await.unwrap();
    assert!(permissions.iter().all(|p| permission_is_valid(&master, p)));
    let regranted = permissions.iter().find(tester2).unwrap();
    assert!(regranted.allow_read);
    assert!(!regranted.allow_share && !regranted.allow_delete && !regranted.allow_update);

    // still named in the marking, so reading comes back but sharing does not
    assert_eq!(h.get(TESTER2, &props).await.status, StatusCode::OK);
    let escalate = json!({"share": TESTER10, "allowRead": true, "allowDelete": true});
    assert_eq!(h.json(TESTER2, "POST", &shared, escalate).await.status, StatusCode::FORBIDDEN);
    let delete = json!({"changeToken": reply.json()["changeToken"]});
    assert_eq!(h.json(TESTER2, "DELETE", &format!("/objects/{id}"), delete).await.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn evicted_content_is_pulled_back() {
    let h = Harness::standalone().await;
    let created = h.create_file(TESTER1, open_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();
    let connector = connector_of(&h, id).await;
    let cached = format!("{connector}.cached");
    h.wait_for_cached(&cached).await;

    std::fs::remove_file(h.cache_file(&cached)).unwrap();
    let reply = h.get(TESTER1, &format!("/objects/{id}/stream")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], &PAYLOAD[..]);
    assert!(h.cache_file(&cached).exists());
    assert!(!h.cache_file(&format!("{connector}.caching")).exists());
}

#[tokio::test]
async fn private_objects_are_hidden_from_others() {
    let h = Harness::standalone().await;
    let acm = json!({"classif": "U", "share": {"users": [TESTER1]}});
    let created = h.create_file(TESTER1, acm, PAYLOAD).await;
    let id = created["id"].as_str().unwrap();

    assert_eq!(h.get(TESTER2, &format!("/objects/{id}/properties")).await.status, StatusCode::FORBIDDEN);
    assert_eq!(h.get(TESTER2, &format!("/objects/{id}/stream")).await.status, StatusCode::FORBIDDEN);
    let roots = h.get(TESTER2, "/objects").await.json();
    assert_eq!(roots["totalRows"], 0);

    let roots = h.get(TESTER1, "/objects").await.json();
    assert_eq!(roots["totalRows"], 1);
    assert_eq!(roots["objects"][0]["id"], id);
    assert_eq!(roots["objects"][0]["callerPermission"]["allowRead"], true);
}

#[tokio::test]
async fn folders_children_and_trash() {
    let h = Harness::standalone().await;
    let folder = h
        .json(
            TESTER1,
            "POST",
            "/objects",
            json!({"name": "docs", "typeName": "Folder", "acm": open_acm()}),
        )
        .await;
    assert_eq!(folder.status, StatusCode::OK, "{}", String::from_utf8_lossy(&folder.body));
    let folder = folder.json();
    let folder_id = folder["id"].as_str().unwrap();
    assert_eq!(h.get(TESTER1, &format!("/objects/{folder_id}/stream")).await.status, StatusCode::NO_CONTENT);

    let child = h
        .multipart(
            TESTER1,
            "/objects",
            json!({"typeName": "File", "parentId": folder_id, "acm": open_acm()}),
            "notes.csv",
            b"a,b\n1,2\n",
        )
        .await;
    assert_eq!(child.status, StatusCode::OK, "{}", String::from_utf8_lossy(&child.body));
    let child = child.json();
    assert_eq!(child["name"], "notes.csv");
    assert_eq!(child["contentType"], "text/csv");
    let child_id = child["id"].as_str().unwrap();

    let listing = h.get(TESTER1, &format!("/objects/{folder_id}")).await.json();
    assert_eq!(listing["totalRows"], 1);
    assert_eq!(listing["objects"][0]["id"], child_id);

    let trashed = h
        .json(
            TESTER1,
            "POST",
            &format!("/objects/{folder_id}/trash"),
            json!({"changeToken": folder["changeToken"]}),
        )
        .await;
    assert_eq!(trashed.status, StatusCode::OK);
    let trashed = trashed.json();
    assert_eq!(trashed["isDeleted"], true);
    assert_eq!(
        h.get(TESTER1, &format!("/objects/{child_id}/properties")).await.status,
        StatusCode::METHOD_NOT_ALLOWED
    );
    let trash = h.get(TESTER1, "/trash").await.json();
    assert_eq!(trash["totalRows"], 1);
    assert_eq!(trash["objects"][0]["id"], folder_id);

    let restored = h
        .json(
            TESTER1,
            "POST",
            &format!("/objects/{folder_id}/untrash"),
            json!({"changeToken": trashed["changeToken"]}),
        )
        .await;
    assert_eq!(restored.status, StatusCode::OK);
    assert_eq!(h.get(TESTER1, &format!("/objects/{child_id}/properties")).await.status, StatusCode::OK);

    let current = h.get(TESTER1, &format!("/objects/{child_id}/properties")).await.json();
    let expunged = h
        .json(
            TESTER1,
            "DELETE",
            &format!("/objects/{child_id}"),
            json!({"changeToken": current["changeToken"]}),
        )
        .await;
    assert_eq!(expunged.status, StatusCode::OK);
    assert_eq!(h.get(TESTER1, &format!("/objects/{child_id}/stream")).await.status, StatusCode::GONE);
}

#[tokio::test]
async fn stream_update_keeps_history() {
    let h = Harness::standalone().await;
    let created = h.create_file(TESTER1, open_acm(), PAYLOAD).await;
    let id = created["id"].as_str().unwrap();

    let stale = h
        .multipart(
            TESTER1,
            &format!("/objects/{id}/stream"),
            json!({"changeToken": "0000"}),
            "f",
            b"second",
        )
        .await;
    assert_eq!(stale.status.as_u16(), 428);

    let updated = h
        .multipart(
            TESTER1,
            &format!("/objects/{id}/stream"),
            json!({"changeToken": created["changeToken"]}),
            "f",
            b"second version",
        )
        .await;
    assert_eq!(updated.status, StatusCode::OK, "{}", String::from_utf8_lossy(&updated.body));
    assert_eq!(updated.json()["changeCount"], 1);

    let latest = h.get(TESTER1, &format!("/objects/{id}/stream")).await;
    assert_eq!(&latest.body[..], b"second version");

    let revisions = h.get(TESTER1, &format!("/revisions/{id}")).await.json();
    assert_eq!(revisions["totalRows"], 2);
    assert_eq!(revisions["objects"][0]["changeCount"], 1);

    let original = h.get(TESTER1, &format!("/revisions/{id}/0/stream")).await;
    assert_eq!(original.status, StatusCode::OK);
    assert_eq!(&original.body[..], &PAYLOAD[..]);
}

#[tokio::test]
async fn request_validation() {
    let h = Harness::standalone().await;
    let anonymous = h
        .send(
            axum::http::Request::builder()
                .uri("/objects")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(anonymous.status, StatusCode::BAD_REQUEST);
    assert_eq!(&anonymous.body[..], b"Cannot determine user from request");

    assert_eq!(h.get(TESTER1, "/objects/not-hex/properties").await.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        h.get(TESTER1, &format!("/objects/{}/properties", "0".repeat(32))).await.status,
        StatusCode::NOT_FOUND
    );

    let no_acm = h
        .json(TESTER1, "POST", "/objects", json!({"name": "x", "typeName": "File"}))
        .await;
    assert_eq!(no_acm.status, StatusCode::BAD_REQUEST);

    let missing = "0".repeat(32);
    let wrong_type = h
        .json(TESTER1, "POST", &format!("/objects/{missing}/trash"), json!({"changeToken": 5}))
        .await;
    assert_eq!(wrong_type.status, StatusCode::BAD_REQUEST);

    let untyped = h
        .send(
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/objects/{missing}/properties"))
                .header("USER_DN", TESTER1)
                .body(axum::body::Body::from(r#"{"name":"x"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(untyped.status, StatusCode::BAD_REQUEST);

    let oversized = h
        .json(
            TESTER1,
            "POST",
            &format!("/objects/{missing}/trash"),
            json!({"changeToken": "a".repeat(object_drive::routes::routes::JSON_BODY_LIMIT)}),
        )
        .await;
    assert_eq!(oversized.status, StatusCode::BAD_REQUEST);

    let stats = h.get(TESTER1, "/stats").await;
    assert_eq!(stats.status, StatusCode::OK);
    let text = String::from_utf8_lossy(&stats.body);
    assert!(text.contains("# errors"));
    assert!(text.contains("404\t1\t"));
    assert!(h.state.errors.count(400) >= 6);
}
