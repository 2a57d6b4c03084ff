//! In-process `GitlabApi` fake shared by the crate's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use glu_gitlab::{
    ApprovalState, GitlabApi, GitlabError, GitlabResult, GitlabUser, MergeRequest,
    MergeRequestDiff, MergeRequestFilter, Page, Project,
};

pub fn project(id: u64, name: &str) -> Project {
    Project {
        id,
        name: name.to_string(),
        name_with_namespace: format!("platform / {name}"),
        path_with_namespace: format!("platform/{name}"),
        web_url: None,
    }
}

/// Merge request `id` in project 42.
pub fn merge_request(id: u64, iid: u64, status: &str) -> MergeRequest {
    MergeRequest {
        id,
        iid,
        project_id: 42,
        title: format!("chore(deps): bump crate {iid}"),
        state: "opened".to_string(),
        detailed_merge_status: status.to_string(),
        draft: false,
        source_branch: format!("renovate/{iid}"),
        target_branch: "main".to_string(),
        author: Some(GitlabUser {
            id: 7,
            username: "renovate-bot".to_string(),
            name: "Renovate".to_string(),
        }),
        web_url: None,
        created_at: None,
        updated_at: None,
    }
}

pub fn diff(path: &str, text: &str) -> MergeRequestDiff {
    MergeRequestDiff {
        old_path: path.to_string(),
        new_path: path.to_string(),
        diff: text.to_string(),
        new_file: false,
        renamed_file: false,
        deleted_file: false,
    }
}

fn failure(operation: &str) -> GitlabError {
    GitlabError::HttpStatus {
        operation: operation.to_string(),
        status: 500,
        body: "injected failure".to_string(),
    }
}

fn paged<T: Clone>(pages: &[Vec<T>], page: u32) -> Page<T> {
    let index = page.saturating_sub(1) as usize;
    let items = pages.get(index).cloned().unwrap_or_default();
    let next_page = (index + 1 < pages.len()).then_some(page + 1);
    Page { items, next_page }
}

#[derive(Default)]
struct FakeState {
    project_pages: Vec<Vec<Project>>,
    merge_request_pages: Vec<Vec<MergeRequest>>,
    failing_merge_request_page: Option<u32>,
    merge_requests: HashMap<(u64, u64), MergeRequest>,
    diff_pages: HashMap<(u64, u64), Vec<Vec<MergeRequestDiff>>>,
    fail_get: bool,
    fail_approve: bool,
    fail_accept: bool,
    project_page_calls: usize,
    merge_request_page_calls: usize,
    approve_calls: usize,
    accept_calls: usize,
}

type MutationHook = Arc<dyn Fn() + Send + Sync>;

/// Approving flips `not_approved` to `mergeable`; accepting marks the request merged.
#[derive(Default)]
pub struct FakeGitlab {
    state: Mutex<FakeState>,
    on_mutation: Mutex<Option<MutationHook>>,
}

impl FakeGitlab {
    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().expect("fake state lock");
        f(&mut state)
    }

    pub fn set_projects_pages(&self, pages: Vec<Vec<Project>>) {
        self.with_state(|state| state.project_pages = pages);
    }

    pub fn set_merge_request_pages(&self, pages: Vec<Vec<MergeRequest>>) {
        self.with_state(|state| {
            for merge_request in pages.iter().flatten() {
                state.merge_requests.insert(
                    (merge_request.project_id, merge_request.iid),
                    merge_request.clone(),
                );
            }
            state.merge_request_pages = pages;
        });
    }

    pub fn fail_merge_request_page(&self, page: u32) {
        self.with_state(|state| state.failing_merge_request_page = Some(page));
    }

    pub fn put_merge_request(&self, merge_request: MergeRequest) {
        self.with_state(|state| {
            state
                .merge_requests
                .insert((merge_request.project_id, merge_request.iid), merge_request);
        });
    }

    pub fn set_diff_pages(&self, project_id: u64, iid: u64, pages: Vec<Vec<MergeRequestDiff>>) {
        self.with_state(|state| {
            state.diff_pages.insert((project_id, iid), pages);
        });
    }

    /// Runs `hook` at the start of every approve or merge call.
    pub fn on_mutation(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_mutation.lock().expect("hook lock") = Some(Arc::new(hook));
    }

    fn run_mutation_hook(&self) {
        let hook = self.on_mutation.lock().expect("hook lock").clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn set_fail_get(&self, fail: bool) {
        self.with_state(|state| state.fail_get = fail);
    }

    pub fn set_fail_approve(&self, fail: bool) {
        self.with_state(|state| state.fail_approve = fail);
    }

    pub fn set_fail_accept(&self, fail: bool) {
        self.with_state(|state| state.fail_accept = fail);
    }

    pub fn project_page_calls(&self) -> usize {
        self.with_state(|state| state.project_page_calls)
    }

    pub fn merge_request_page_calls(&self) -> usize {
        self.with_state(|state| state.merge_request_page_calls)
    }

    pub fn approve_calls(&self) -> usize {
        self.with_state(|state| state.approve_calls)
    }

    pub fn accept_calls(&self) -> usize {
        self.with_state(|state| state.accept_calls)
    }
}

#[async_trait]
impl GitlabApi for FakeGitlab {
    async fn current_user(&self) -> GitlabResult<GitlabUser> {
        Ok(GitlabUser {
            id: 1,
            username: "automation".to_string(),
            name: "Automation".to_string(),
        })
    }

    async fn list_projects(&self, page: u32) -> GitlabResult<Page<Project>> {
        Ok(self.with_state(|state| {
            state.project_page_calls += 1;
            paged(&state.project_pages, page)
        }))
    }

    async fn list_merge_requests(
        &self,
        _filter: &MergeRequestFilter,
        page: u32,
    ) -> GitlabResult<Page<MergeRequest>> {
        self.with_state(|state| {
            state.merge_request_page_calls += 1;
            if state.failing_merge_request_page == Some(page) {
                return Err(failure("merge request listing"));
            }
            Ok(paged(&state.merge_request_pages, page))
        })
    }

    async fn get_merge_request(&self, project_id: u64, iid: u64) -> GitlabResult<MergeRequest> {
        self.with_state(|state| {
            if state.fail_get {
                return Err(failure("merge request lookup"));
            }
            state
                .merge_requests
                .get(&(project_id, iid))
                .cloned()
                .ok_or_else(|| GitlabError::HttpStatus {
                    operation: "merge request lookup".to_string(),
                    status: 404,
                    body: "not found".to_string(),
                })
        })
    }

    async fn list_merge_request_diffs(
        &self,
        project_id: u64,
        iid: u64,
        page: u32,
    ) -> GitlabResult<Page<MergeRequestDiff>> {
        Ok(self.with_state(|state| {
            let pages = state
                .diff_pages
                .get(&(project_id, iid))
                .cloned()
                .unwrap_or_default();
            paged(&pages, page)
        }))
    }

    async fn approve_merge_request(
        &self,
        project_id: u64,
        iid: u64,
    ) -> GitlabResult<ApprovalState> {
        self.run_mutation_hook();
        self.with_state(|state| {
            state.approve_calls += 1;
            if state.fail_approve {
                return Err(failure("merge request approval"));
            }
            let merge_request = state
                .merge_requests
                .get_mut(&(project_id, iid))
                .ok_or_else(|| failure("merge request approval"))?;
            if merge_request.detailed_merge_status == "not_approved" {
                merge_request.detailed_merge_status = "mergeable".to_string();
            }
            Ok(ApprovalState {
                id: merge_request.id,
                iid,
                project_id,
                approved: true,
                approvals_left: 0,
            })
        })
    }

    async fn accept_merge_request(&self, project_id: u64, iid: u64) -> GitlabResult<MergeRequest> {
        self.run_mutation_hook();
        self.with_state(|state| {
            state.accept_calls += 1;
            if state.fail_accept {
                return Err(failure("merge request merge"));
            }
            let merge_request = state
                .merge_requests
                .get_mut(&(project_id, iid))
                .ok_or_else(|| failure("merge request merge"))?;
            merge_request.state = "merged".to_string();
            merge_request.detailed_merge_status = "not_open".to_string();
            Ok(merge_request.clone())
        })
    }
}
