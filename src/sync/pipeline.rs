use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::dto::PlainCredentials;
use crate::sync::dto::JobStatus;

/// The work stages between `starting` and `completed`, in execution order.
pub const PIPELINE: [JobStatus; 5] = [
    JobStatus::CreatingTables,
    JobStatus::FetchingCourses,
    JobStatus::AnalyzingContent,
    JobStatus::ClassifyingData,
    JobStatus::SavingToDatabase,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CourseRef {
    pub id: String,
    pub name: String,
}

/// Output of a pipeline stage, tagged by the stage that produced it so each
/// worker's result is statically checked rather than an untyped bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageData {
    Tables {
        created: Vec<String>,
    },
    Courses {
        courses: Vec<CourseRef>,
    },
    Analysis {
        items_analyzed: u32,
        course_count: u32,
    },
    Classification {
        assignments: u32,
        exams: u32,
        lectures: u32,
        other: u32,
    },
    Saved {
        records_written: u32,
    },
}

/// Executes one pipeline stage. The orchestrator is agnostic to what a
/// stage actually does; it only sequences stages and records progress.
#[async_trait]
pub trait StageWorker: Send + Sync {
    async fn run(
        &self,
        stage: JobStatus,
        credentials: &PlainCredentials,
        prior: Option<&StageData>,
    ) -> anyhow::Result<StageData>;
}

/// Delegates stage work to the scraping/analysis service over HTTP.
pub struct HttpStageWorker {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct StageRequest<'a> {
    username: &'a str,
    password: &'a str,
    institution_id: &'a str,
    prior: Option<&'a StageData>,
}

impl HttpStageWorker {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl StageWorker for HttpStageWorker {
    async fn run(
        &self,
        stage: JobStatus,
        credentials: &PlainCredentials,
        prior: Option<&StageData>,
    ) -> anyhow::Result<StageData> {
        let url = format!("{}/stages/{}", self.base_url, stage.as_str());
        let response = self
            .http
            .post(&url)
            .json(&StageRequest {
                username: &credentials.username,
                password: &credentials.password,
                institution_id: &credentials.institution_id,
                prior,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<StageData>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_data_round_trips_with_stage_tag() {
        let data = StageData::Classification {
            assignments: 3,
            exams: 1,
            lectures: 7,
            other: 0,
        };
        let value = serde_json::to_value(&data).expect("serialize");
        assert_eq!(value["stage"], "classification");

        let back: StageData = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, data);
    }

    #[test]
    fn pipeline_order_matches_status_order() {
        let mut indices: Vec<u8> = PIPELINE.iter().map(|s| s.order_index()).collect();
        let sorted = {
            let mut v = indices.clone();
            v.sort_unstable();
            v
        };
        assert_eq!(indices, sorted);
        indices.dedup();
        assert_eq!(indices.len(), PIPELINE.len());
    }
}
