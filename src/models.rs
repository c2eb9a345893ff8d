use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    #[serde(alias = "complete")]
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the lifecycle. Statuses only ever move to an equal or higher rank.
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input: Map<String, Value>,
    pub output_path: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub progress: u8,
}

impl ExportJob {
    pub fn queued(id: impl Into<String>, input: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            input,
            output_path: None,
            download_url: None,
            error: None,
            progress: 0,
        }
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.input.get("sizeBytes").and_then(Value::as_u64)
    }

    pub fn to_response(&self) -> ExportJobResponse {
        ExportJobResponse {
            job_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            output_path: self.output_path.clone(),
            download_url: self.download_url.clone(),
            error: self.error.clone(),
            size_bytes: self.size_bytes(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A partial update applied by [`crate::store::JobStore::update`].
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub output_path: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    /// Keys merged into the stored input.
    pub input: Option<Map<String, Value>>,
}

impl JobPatch {
    pub fn running(progress: u8) -> Self {
        Self {
            status: Some(JobStatus::Running),
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn completed(
        output_path: impl Into<String>,
        download_url: Option<String>,
        input: Map<String, Value>,
    ) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            output_path: Some(output_path.into()),
            download_url,
            input: Some(input),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub composition: Option<Value>,
    pub tracks: Option<Value>,
}

impl ExportRequest {
    /// Returns the stored job input, or `None` when the payload is malformed.
    pub fn into_input(self) -> Option<Map<String, Value>> {
        let composition = self.composition.filter(is_truthy)?;
        let tracks = self.tracks.filter(Value::is_array)?;

        let mut input = Map::new();
        input.insert("composition".to_string(), composition);
        input.insert("tracks".to_string(), tracks);
        Some(input)
    }
}

// Empty objects and arrays count as present; scalar zero values do not.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAcceptedResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub output_path: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    #[serde(default)]
    pub job_id: Option<Value>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl WebhookRequest {
    pub fn job_id(&self) -> Option<String> {
        let id = match self.job_id.as_ref()? {
            Value::String(raw) => raw.trim().to_string(),
            Value::Number(number) => number.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then_some(id)
    }

    pub fn input(&self) -> Map<String, Value> {
        match &self.payload {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}
