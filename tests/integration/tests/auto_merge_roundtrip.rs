use std::sync::Arc;
use std::time::Duration;

use glu_automerge::{AutoMergeConfig, MergeRequestManager, MergeTarget, INFO_DIFF_CHANGED};
use glu_gitlab::{GitlabApiClient, GitlabClientConfig};
use glu_store::RecordStore;
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{json, Value};
use tempfile::TempDir;

const MR_PATH: &str = "/api/v4/projects/42/merge_requests/5";

fn merge_request_json(status: &str, state: &str) -> Value {
    json!({
        "id": 100,
        "iid": 5,
        "project_id": 42,
        "title": "chore(deps): update rust crate tokio to v1.44",
        "state": state,
        "detailed_merge_status": status,
        "source_branch": "renovate/tokio-1.x",
        "target_branch": "main",
        "author": { "id": 7, "username": "renovate-bot", "name": "Renovate Bot" },
        "updated_at": "2024-05-17T08:55:00Z"
    })
}

fn mock_catalog(server: &MockServer) {
    server.mock(|when, then| {
        when.method(GET).path("/api/v4/projects");
        then.status(200).json_body(json!([{
            "id": 42,
            "name": "billing",
            "name_with_namespace": "Platform / billing",
            "path_with_namespace": "platform/billing"
        }]));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/api/v4/merge_requests")
            .query_param("author_username", "renovate-bot");
        then.status(200)
            .json_body(json!([merge_request_json("not_approved", "opened")]));
    });
}

fn mock_merge_request_status<'a>(server: &'a MockServer, status: &str, state: &str) -> Mock<'a> {
    let body = merge_request_json(status, state);
    server.mock(|when, then| {
        when.method(GET).path(MR_PATH);
        then.status(200).json_body(body);
    })
}

fn mock_diff<'a>(server: &'a MockServer, text: &str) -> Mock<'a> {
    let body = json!([{
        "old_path": "Cargo.toml",
        "new_path": "Cargo.toml",
        "diff": text
    }]);
    server.mock(|when, then| {
        when.method(GET).path(format!("{MR_PATH}/diffs"));
        then.status(200).json_body(body);
    })
}

fn manager(server: &MockServer, state_dir: &TempDir) -> MergeRequestManager {
    let store = RecordStore::open(state_dir.path().join("records.redb")).expect("open store");
    let api = GitlabApiClient::new(GitlabClientConfig::new(
        server.url("/api/v4"),
        "glpat-integration",
    ))
    .expect("client");
    let config = AutoMergeConfig {
        enqueue_interval: Duration::from_millis(400),
        ..AutoMergeConfig::default().with_author("renovate-bot")
    };
    MergeRequestManager::new(Arc::new(store), Arc::new(api), config).expect("manager")
}

fn target(manager: &MergeRequestManager) -> Option<MergeTarget> {
    manager
        .targets()
        .expect("targets")
        .into_iter()
        .find(|target| target.id == 100)
}

#[tokio::test]
async fn integration_authorized_request_is_approved_then_merged() {
    let server = MockServer::start();
    mock_catalog(&server);
    let mut status_mock = mock_merge_request_status(&server, "not_approved", "opened");
    mock_diff(&server, "-tokio = \"1.43\"\n+tokio = \"1.44\"");
    let approve = server.mock(|when, then| {
        when.method(POST).path(format!("{MR_PATH}/approve"));
        then.status(201).json_body(json!({
            "id": 100, "iid": 5, "project_id": 42, "approved": true, "approvals_left": 0
        }));
    });
    let merge = server.mock(|when, then| {
        when.method(PUT).path(format!("{MR_PATH}/merge"));
        then.status(200)
            .json_body(merge_request_json("not_open", "merged"));
    });

    let state_dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(&server, &state_dir);
    let items = manager.get_or_refresh_items(false).await.expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].human_id(), "platform/billing!5");

    let diffs = manager.pull_diff(100).await.expect("diff");
    manager.authorize_and_track(100, &diffs).expect("track");
    assert!(manager.start());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut swapped = false;
    loop {
        if !swapped && approve.calls() > 0 {
            // GitLab reports the request mergeable once the approval lands.
            status_mock.delete();
            status_mock = mock_merge_request_status(&server, "mergeable", "opened");
            swapped = true;
        }
        if target(&manager).is_some_and(|target| !target.active) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "automation did not finish: {:?}",
            target(&manager)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    manager.shutdown().await;

    let finished = target(&manager).expect("target");
    assert_eq!(finished.info, "merged");
    approve.assert_calls(1);
    merge.assert_calls(1);
    let snapshot = manager.get_item(100).expect("item").expect("cached");
    assert_eq!(snapshot.state, "merged");
    status_mock.assert_calls(1);
}

#[tokio::test]
async fn integration_changed_diff_aborts_before_approval() {
    let server = MockServer::start();
    mock_catalog(&server);
    mock_merge_request_status(&server, "not_approved", "opened");
    let mut diff_mock = mock_diff(&server, "+tokio = \"1.44\"");
    let approve = server.mock(|when, then| {
        when.method(POST).path(format!("{MR_PATH}/approve"));
        then.status(201).json_body(json!({ "id": 100, "iid": 5, "project_id": 42 }));
    });

    let state_dir = tempfile::tempdir().expect("tempdir");
    let manager = manager(&server, &state_dir);
    manager.get_or_refresh_items(false).await.expect("items");
    let reviewed = manager.pull_diff(100).await.expect("diff");
    manager.authorize_and_track(100, &reviewed).expect("track");

    // A new commit lands after the human reviewed the diff.
    diff_mock.delete();
    diff_mock = mock_diff(&server, "+tokio = \"1.44\"\n+evil = \"0.1\"");
    assert!(manager.start());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while target(&manager).is_some_and(|target| target.active) {
        assert!(tokio::time::Instant::now() < deadline, "target still active");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.shutdown().await;

    assert_eq!(target(&manager).expect("target").info, INFO_DIFF_CHANGED);
    approve.assert_calls(0);
    diff_mock.assert_calls(1);
}
