use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::options::{AspectRatio, GenerationRequest, OutputFormat, Resolution};

/// Application-level success code carried inside every response envelope.
pub const SUCCESS_CODE: i64 = 200;

const DEFAULT_FAIL_CODE: &str = "Unknown";
const DEFAULT_FAIL_MSG: &str = "Task failed";

/// Body of `POST /api/v1/jobs/createTask`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskPayload<'a> {
    pub model: &'a str,
    pub input: CreateTaskInput<'a>,
    #[serde(rename = "callBackUrl", skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskInput<'a> {
    pub prompt: &'a str,
    pub aspect_ratio: AspectRatio,
    pub resolution: Resolution,
    pub output_format: OutputFormat,
    pub image_input: &'a [String],
}

impl<'a> CreateTaskPayload<'a> {
    pub fn from_request(model: &'a str, request: &'a GenerationRequest) -> Self {
        Self {
            model,
            input: CreateTaskInput {
                prompt: &request.prompt,
                aspect_ratio: request.aspect_ratio,
                resolution: request.resolution,
                output_format: request.output_format,
                image_input: &request.image_input,
            },
            callback_url: request.callback_url.as_deref(),
        }
    }
}

/// Outer `{code, msg, data}` wrapper shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    pub fn message(&self) -> &str {
        self.msg
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("Unknown error")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedTask {
    #[serde(rename = "taskId", default, deserialize_with = "lenient_string")]
    pub task_id: Option<String>,
}

/// Lifecycle state as reported by `recordInfo`.
///
/// Unknown strings are kept as [`JobState::Other`] and treated as in progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Waiting,
    Queuing,
    Generating,
    Success,
    Fail,
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Queuing => "queuing",
            JobState::Generating => "generating",
            JobState::Success => "success",
            JobState::Fail => "fail",
            JobState::Other(raw) => raw.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Fail)
    }
}

impl From<&str> for JobState {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "waiting" => JobState::Waiting,
            "queuing" => JobState::Queuing,
            "generating" => JobState::Generating,
            "success" => JobState::Success,
            "fail" => JobState::Fail,
            other => JobState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(JobState::from).unwrap_or_default())
    }
}

impl Serialize for JobState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// `data` object of a `recordInfo` response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "taskId", default, deserialize_with = "lenient_string")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub state: JobState,
    #[serde(rename = "failCode", default, deserialize_with = "verbatim_string")]
    pub fail_code: Option<String>,
    #[serde(rename = "failMsg", default, deserialize_with = "verbatim_string")]
    pub fail_msg: Option<String>,
    /// Still JSON-encoded; see [`JobRecord::decode_result`].
    #[serde(rename = "resultJson", default, deserialize_with = "lenient_json_text")]
    pub result_json: Option<String>,
}

impl JobRecord {
    pub fn fail_code_or_default(&self) -> &str {
        self.fail_code.as_deref().unwrap_or(DEFAULT_FAIL_CODE)
    }

    pub fn fail_msg_or_default(&self) -> &str {
        self.fail_msg.as_deref().unwrap_or(DEFAULT_FAIL_MSG)
    }

    /// Second decoding stage: `resultJson` is a string holding another JSON
    /// document. `Ok(None)` means the service sent no result at all.
    pub fn decode_result(&self) -> Result<Option<ResultPayload>, serde_json::Error> {
        let Some(raw) = self
            .result_json
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Ok(None);
        };
        serde_json::from_str(raw).map(Some)
    }
}

/// Decoded form of `resultJson`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "resultUrls", default)]
    pub result_urls: Vec<String>,
}

impl ResultPayload {
    pub fn usable_urls(&self) -> Vec<&str> {
        self.result_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .collect()
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Service text kept exactly as sent; only absence (or null) maps to `None`.
fn verbatim_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

// Some gateways inline the result as an object instead of a string; re-encode
// it so the second stage still has one input shape.
fn lenient_json_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(value @ (Value::Object(_) | Value::Array(_))) => Some(value.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::options::{AspectRatio, GenerationRequest};

    #[test]
    fn create_payload_uses_wire_field_names() -> anyhow::Result<()> {
        let request = GenerationRequest::new("draw a market")
            .with_aspect_ratio(AspectRatio::Square)
            .with_callback_url(Some("https://hooks.test/cb".to_string()));
        let payload = serde_json::to_value(CreateTaskPayload::from_request(
            "nano-banana-pro",
            &request,
        ))?;

        assert_eq!(
            payload,
            json!({
                "model": "nano-banana-pro",
                "input": {
                    "prompt": "draw a market",
                    "aspect_ratio": "1:1",
                    "resolution": "2K",
                    "output_format": "png",
                    "image_input": [],
                },
                "callBackUrl": "https://hooks.test/cb",
            })
        );
        Ok(())
    }

    #[test]
    fn create_payload_omits_missing_callback() -> anyhow::Result<()> {
        let request = GenerationRequest::new("p");
        let payload = serde_json::to_value(CreateTaskPayload::from_request("m", &request))?;
        assert!(payload.get("callBackUrl").is_none());
        assert!(payload.get("callback_url").is_none());
        Ok(())
    }

    #[test]
    fn record_envelope_decodes_failure_fields() -> anyhow::Result<()> {
        let envelope: Envelope<JobRecord> = serde_json::from_value(json!({
            "code": 200,
            "msg": "success",
            "data": {"taskId": "t-1", "state": "fail", "failCode": "E1", "failMsg": "boom"}
        }))?;
        let record = envelope.data.clone().unwrap_or_default();
        assert!(envelope.is_success());
        assert_eq!(record.state, JobState::Fail);
        assert_eq!(record.fail_code_or_default(), "E1");
        assert_eq!(record.fail_msg_or_default(), "boom");
        Ok(())
    }

    #[test]
    fn missing_state_reads_as_waiting_and_unknown_states_survive() -> anyhow::Result<()> {
        let record: JobRecord = serde_json::from_value(json!({"taskId": "t"}))?;
        assert_eq!(record.state, JobState::Waiting);

        let record: JobRecord = serde_json::from_value(json!({"state": "Rendering"}))?;
        assert_eq!(record.state, JobState::Other("rendering".to_string()));
        assert!(!record.state.is_terminal());
        Ok(())
    }

    #[test]
    fn fail_fields_are_kept_verbatim() -> anyhow::Result<()> {
        let record: JobRecord =
            serde_json::from_value(json!({"state": "fail", "failCode": 501, "failMsg": ""}))?;
        assert_eq!(record.fail_code.as_deref(), Some("501"));
        assert_eq!(record.fail_msg_or_default(), "");

        let record: JobRecord = serde_json::from_value(
            json!({"state": "fail", "failCode": " E1 ", "failMsg": "  boom\n"}),
        )?;
        assert_eq!(record.fail_code_or_default(), " E1 ");
        assert_eq!(record.fail_msg_or_default(), "  boom\n");
        Ok(())
    }

    #[test]
    fn absent_fail_fields_use_defaults() -> anyhow::Result<()> {
        let record: JobRecord =
            serde_json::from_value(json!({"state": "fail", "failCode": null}))?;
        assert_eq!(record.fail_code_or_default(), "Unknown");
        assert_eq!(record.fail_msg_or_default(), "Task failed");
        Ok(())
    }

    #[test]
    fn result_json_is_decoded_in_a_second_stage() -> anyhow::Result<()> {
        let record: JobRecord = serde_json::from_value(json!({
            "state": "success",
            "resultJson": "{\"resultUrls\":[\"https://cdn.test/a.png\",\" \"]}"
        }))?;
        let payload = record.decode_result()?.unwrap_or_default();
        assert_eq!(payload.usable_urls(), vec!["https://cdn.test/a.png"]);
        Ok(())
    }

    #[test]
    fn malformed_result_json_is_an_error_not_empty() {
        let record = JobRecord {
            state: JobState::Success,
            result_json: Some("{not json".to_string()),
            ..JobRecord::default()
        };
        assert!(record.decode_result().is_err());
    }

    #[test]
    fn missing_result_json_decodes_to_none() -> anyhow::Result<()> {
        let record = JobRecord {
            state: JobState::Success,
            ..JobRecord::default()
        };
        assert_eq!(record.decode_result()?, None);
        Ok(())
    }

    #[test]
    fn envelope_message_falls_back_when_blank() -> anyhow::Result<()> {
        let envelope: Envelope<CreatedTask> =
            serde_json::from_value(json!({"code": 401, "msg": "  "}))?;
        assert!(!envelope.is_success());
        assert_eq!(envelope.message(), "Unknown error");
        assert!(envelope.data.is_none());
        Ok(())
    }
}
