//! The Jenkins HTTP client.
//!
//! [`JenkinsOps`] is the seam the state machine drives; tests substitute an
//! in-memory fake. The real client talks to the Jenkins JSON API with HTTP
//! Basic auth and redirects disabled (the stop endpoint answers 302 on
//! success, which must be observed rather than followed).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::JenkinsConfig;
use crate::types::{BuildNumber, BuildRef, RequestId};

use super::build::{BuildTree, BUILD_TREE_PROJECTION};
use super::{JenkinsError, Result};

/// Build parameter carrying the tested build ref.
pub const BUILD_REF_PARAM: &str = "build_ref";
/// Build parameter carrying the trigger correlation ID.
pub const REQUEST_ID_PARAM: &str = "request_id";

/// Jenkins operations the state machine depends on.
#[async_trait]
pub trait JenkinsOps: Send + Sync + 'static {
    /// Triggers a build of `job` for `build_ref`, tagged with `request_id`.
    /// The response carries no build number.
    async fn trigger_build(
        &self,
        job: &str,
        build_ref: &BuildRef,
        request_id: &RequestId,
    ) -> Result<()>;

    /// Polls the job's recent builds until one whose parameters contain
    /// `request_id` appears. Exceeding `timeout` is a hard error.
    async fn find_build_by_request_id(
        &self,
        job: &str,
        request_id: &RequestId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<BuildNumber>;

    /// Fetches the (projected) build tree.
    async fn get_build_tree(&self, job: &str, number: BuildNumber) -> Result<BuildTree>;

    /// Sets the build's HTML description.
    async fn set_build_description(
        &self,
        job: &str,
        number: BuildNumber,
        html: &str,
    ) -> Result<()>;

    /// Cancels a build via its stop endpoint. HTTP 200 and 302 both mean
    /// success (a Jenkins quirk).
    async fn cancel_build(&self, build_url: &str) -> Result<()>;
}

/// The production Jenkins client.
#[derive(Debug, Clone)]
pub struct JenkinsClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    token: String,
}

impl JenkinsClient {
    pub fn new(config: &JenkinsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|source| JenkinsError::Transport {
                context: "building HTTP client".to_string(),
                source,
            })?;
        Ok(JenkinsClient {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            token: config.token.clone(),
        })
    }

    fn job_url(&self, job: &str) -> String {
        format!("{}/job/{}", self.base_url, job)
    }

    /// The canonical URL of a build within a job.
    pub fn build_url(&self, job: &str, number: BuildNumber) -> String {
        format!("{}/{}/", self.job_url(job), number.0)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        context: &str,
    ) -> Result<T> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|source| JenkinsError::Transport {
                context: context.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(JenkinsError::Http {
                status: status.as_u16(),
                context: context.to_string(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| JenkinsError::Transport {
                context: context.to_string(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| JenkinsError::Parse {
            context: context.to_string(),
            source,
        })
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        context: &str,
        accept_statuses: &[u16],
    ) -> Result<()> {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.user, Some(&self.token))
            .form(form)
            .send()
            .await
            .map_err(|source| JenkinsError::Transport {
                context: context.to_string(),
                source,
            })?;
        let status = response.status();
        if status.is_success() || accept_statuses.contains(&status.as_u16()) {
            Ok(())
        } else {
            Err(JenkinsError::Http {
                status: status.as_u16(),
                context: context.to_string(),
            })
        }
    }
}

/// Build list shape used when searching for a request ID.
#[derive(Deserialize)]
struct JobBuilds {
    #[serde(default)]
    builds: Vec<BuildWithActions>,
}

#[derive(Deserialize)]
struct BuildWithActions {
    number: u64,
    #[serde(default)]
    actions: Vec<BuildAction>,
}

#[derive(Deserialize)]
struct BuildAction {
    #[serde(default)]
    parameters: Vec<BuildParameter>,
}

#[derive(Deserialize)]
struct BuildParameter {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

impl BuildWithActions {
    fn has_request_id(&self, request_id: &RequestId) -> bool {
        self.actions.iter().flat_map(|a| &a.parameters).any(|p| {
            p.name == REQUEST_ID_PARAM && p.value.as_str() == Some(request_id.as_str())
        })
    }
}

#[async_trait]
impl JenkinsOps for JenkinsClient {
    async fn trigger_build(
        &self,
        job: &str,
        build_ref: &BuildRef,
        request_id: &RequestId,
    ) -> Result<()> {
        let url = format!("{}/buildWithParameters", self.job_url(job));
        let context = format!("triggering {job}");
        self.post_form(
            &url,
            &[
                (BUILD_REF_PARAM, build_ref.as_str()),
                (REQUEST_ID_PARAM, request_id.as_str()),
            ],
            &context,
            &[],
        )
        .await?;
        info!(job, build_ref = %build_ref, request_id = %request_id, "Triggered build");
        Ok(())
    }

    async fn find_build_by_request_id(
        &self,
        job: &str,
        request_id: &RequestId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<BuildNumber> {
        let url = format!(
            "{}/api/json?tree=builds[number,actions[parameters[name,value]]]",
            self.job_url(job)
        );
        let context = format!("listing builds of {job}");
        let deadline = Instant::now() + timeout;

        loop {
            let listing: JobBuilds = self.get_json(&url, &context).await?;
            if let Some(build) = listing.builds.iter().find(|b| b.has_request_id(request_id)) {
                debug!(job, request_id = %request_id, number = build.number, "Found build");
                return Ok(BuildNumber(build.number));
            }
            if Instant::now() + poll_interval > deadline {
                return Err(JenkinsError::TriggerTimeout {
                    job: job.to_string(),
                    request_id: request_id.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn get_build_tree(&self, job: &str, number: BuildNumber) -> Result<BuildTree> {
        let url = format!(
            "{}api/json?depth=2&tree={}",
            self.build_url(job, number),
            BUILD_TREE_PROJECTION
        );
        self.get_json(&url, &format!("fetching build tree of {job} {number}"))
            .await
    }

    async fn set_build_description(
        &self,
        job: &str,
        number: BuildNumber,
        html: &str,
    ) -> Result<()> {
        let url = format!("{}submitDescription", self.build_url(job, number));
        self.post_form(
            &url,
            &[("description", html)],
            &format!("setting description of {job} {number}"),
            // Jenkins answers a successful submitDescription with a 302
            // redirect back to the build page rather than a 2xx, the same
            // quirk as the stop endpoint. With redirects disabled the 302
            // itself is the success signal; anything else is fatal.
            &[302],
        )
        .await
    }

    async fn cancel_build(&self, build_url: &str) -> Result<()> {
        let url = format!("{}stop", build_url);
        self.post_form(&url, &[], &format!("cancelling {build_url}"), &[302])
            .await?;
        info!(build_url, "Cancelled build");
        Ok(())
    }
}
