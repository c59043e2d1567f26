use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use poster_contracts::events::{EventWriter, GenerationEvent};
use poster_contracts::options::GenerationRequest;
use poster_contracts::runs::history::{GenerationHistory, HistoryEntry};

pub mod cancel;
pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod progress;
pub mod resolver;
pub mod waiter;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::{CancelToken, Sleeper, ThreadSleeper};
pub use client::{JobHandle, JobId, JobStatus, JobTransport, KieClient};
pub use config::{ClientConfig, WaitOptions};
pub use error::JobError;
pub use progress::{NoProgress, ProgressObserver, ProgressUpdate};
pub use resolver::{ArtifactResolver, ResolvedArtifact};
pub use waiter::{CompletionWaiter, JobResult};
pub use worker::spawn_generation;

use download::{probe_dimensions, sha256_file};

/// Where a finished artifact should go and how to label it in history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: Option<PathBuf>,
    pub label: Option<String>,
}

impl OutputTarget {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            label: None,
        }
    }

    pub fn labelled(mut self, label: Option<String>) -> Self {
        self.label = label
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub job_id: String,
    pub path: PathBuf,
    pub url: String,
    pub bytes: u64,
    pub sha256: String,
    pub dimensions: Option<(u32, u32)>,
    pub polls: u32,
    pub elapsed: Duration,
    pub discarded_urls: Vec<String>,
}

/// Create, wait and download composed into one blocking call.
///
/// Shareable across worker threads behind an `Arc`; every call owns its own
/// job and progress estimate.
pub struct ImageGenerator {
    transport: Arc<dyn JobTransport>,
    waiter: CompletionWaiter,
    resolver: ArtifactResolver,
    events: Option<EventWriter>,
    history: Option<GenerationHistory>,
}

impl ImageGenerator {
    pub fn new(transport: Arc<dyn JobTransport>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            waiter: CompletionWaiter::new(WaitOptions::default()),
            resolver: ArtifactResolver::new(output_dir),
            events: None,
            history: None,
        }
    }

    pub fn from_config(
        config: ClientConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, JobError> {
        let client = KieClient::new(config)?;
        Ok(Self::new(Arc::new(client), output_dir))
    }

    pub fn with_wait_options(mut self, options: WaitOptions) -> Self {
        self.waiter = CompletionWaiter::new(options);
        self
    }

    pub fn with_waiter(mut self, waiter: CompletionWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_history(mut self, history: GenerationHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn transport(&self) -> &dyn JobTransport {
        self.transport.as_ref()
    }

    pub fn output_dir(&self) -> &Path {
        self.resolver.output_dir()
    }

    pub fn history(&self) -> Option<&GenerationHistory> {
        self.history.as_ref()
    }

    /// One-shot status lookup for a job created elsewhere.
    pub fn query_status(&self, job_id: &JobId) -> Result<JobStatus, JobError> {
        self.transport.query_job(job_id, None)
    }

    pub fn generate(
        &self,
        request: &GenerationRequest,
        target: &OutputTarget,
        observer: &mut dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<GeneratedImage, JobError> {
        let mut job_id = None;
        let outcome = self.run_pipeline(request, target, observer, cancel, &mut job_id);
        if let Err(err) = &outcome {
            if err.is_client_side_terminal() {
                tracing::warn!(
                    job_id = job_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "generation stopped"
                );
            } else {
                tracing::error!(
                    job_id = job_id.as_deref().unwrap_or("-"),
                    kind = err.kind(),
                    error = %err,
                    "generation failed"
                );
            }
            self.emit(&GenerationEvent::JobFailed {
                job_id,
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
        }
        outcome
    }

    fn run_pipeline(
        &self,
        request: &GenerationRequest,
        target: &OutputTarget,
        observer: &mut dyn ProgressObserver,
        cancel: &CancelToken,
        job_id_slot: &mut Option<String>,
    ) -> Result<GeneratedImage, JobError> {
        let handle = match self.transport.create_job(request) {
            Ok(handle) => handle,
            Err(err) => {
                observer.close();
                return Err(err);
            }
        };
        *job_id_slot = Some(handle.job_id.to_string());
        observer.on_created(handle.job_id.as_str());
        self.emit(&GenerationEvent::JobCreated {
            job_id: handle.job_id.to_string(),
            model: self.transport.model().to_string(),
            aspect_ratio: request.aspect_ratio.to_string(),
            resolution: request.resolution.to_string(),
            output_format: request.output_format.to_string(),
        });

        let mut observer = EventingObserver {
            inner: observer,
            events: self.events.as_ref(),
        };
        let result = self
            .waiter
            .wait(self.transport.as_ref(), &handle.job_id, &mut observer, cancel)?;
        tracing::info!(
            job_id = %result.job_id,
            polls = result.polls,
            elapsed_s = result.elapsed.as_secs_f64(),
            "job succeeded"
        );
        self.emit(&GenerationEvent::JobSucceeded {
            job_id: result.job_id.to_string(),
            polls: result.polls,
            elapsed_s: result.elapsed.as_secs_f64(),
        });

        let artifact = self.resolver.resolve(
            self.transport.as_ref(),
            &result,
            target.path.as_deref(),
            request.output_format,
        )?;
        let sha256 = sha256_file(&artifact.path).map_err(|err| {
            JobError::io(&artifact.path, std::io::Error::other(format!("{err:#}")))
        })?;
        let dimensions = probe_dimensions(&artifact.path);
        self.emit(&GenerationEvent::ArtifactSaved {
            job_id: result.job_id.to_string(),
            url: artifact.url.clone(),
            path: artifact.path.to_string_lossy().to_string(),
            bytes: artifact.bytes,
            sha256: sha256.clone(),
        });

        if let Some(history) = &self.history {
            let mut entry = HistoryEntry::now(result.job_id.as_str(), &artifact.path);
            entry.label = target.label.clone();
            entry.aspect_ratio = request.aspect_ratio.to_string();
            entry.resolution = request.resolution.to_string();
            entry.output_format = request.output_format.to_string();
            entry.bytes = artifact.bytes;
            entry.sha256 = Some(sha256.clone());
            if let Err(err) = history.append(entry) {
                tracing::warn!(
                    path = %history.path().display(),
                    error = %format!("{err:#}"),
                    "history append failed"
                );
            }
        }

        Ok(GeneratedImage {
            job_id: result.job_id.to_string(),
            path: artifact.path,
            url: artifact.url,
            bytes: artifact.bytes,
            sha256,
            dimensions,
            polls: result.polls,
            elapsed: result.elapsed,
            discarded_urls: artifact.discarded_urls,
        })
    }

    fn emit(&self, event: &GenerationEvent) {
        emit_event(self.events.as_ref(), event);
    }
}

fn emit_event(events: Option<&EventWriter>, event: &GenerationEvent) {
    let Some(events) = events else {
        return;
    };
    if let Err(err) = events.emit(event) {
        tracing::warn!(
            path = %events.path().display(),
            error = %format!("{err:#}"),
            "event write failed"
        );
    }
}

/// Mirrors every poll into the event log before handing it on.
struct EventingObserver<'a> {
    inner: &'a mut dyn ProgressObserver,
    events: Option<&'a EventWriter>,
}

impl ProgressObserver for EventingObserver<'_> {
    fn on_poll(&mut self, update: &ProgressUpdate<'_>) {
        emit_event(
            self.events,
            &GenerationEvent::JobPolled {
                job_id: update.job_id.to_string(),
                poll: update.poll,
                state: update.state.to_string(),
                progress: update.percent,
            },
        );
        self.inner.on_poll(update);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use poster_contracts::events::EventWriter;
    use poster_contracts::options::{AspectRatio, GenerationRequest};
    use poster_contracts::runs::history::GenerationHistory;
    use serde_json::Value;

    use super::{CompletionWaiter, ImageGenerator, OutputTarget, WaitOptions};
    use crate::cancel::CancelToken;
    use crate::error::JobError;
    use crate::testing::{
        failed, success, waiting, CountingSleeper, RecordingObserver, ScriptedTransport,
        PNG_BYTES,
    };

    fn generator(transport: Arc<ScriptedTransport>, dir: &std::path::Path) -> ImageGenerator {
        ImageGenerator::new(transport, dir.join("outputs")).with_waiter(
            CompletionWaiter::new(WaitOptions::default())
                .with_sleeper(Box::new(CountingSleeper::default())),
        )
    }

    fn read_events(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
        fs::read_to_string(path)?
            .lines()
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    #[test]
    fn generate_runs_create_wait_download_and_records_history() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![
            waiting(),
            success(&["https://cdn.test/a.png", "https://cdn.test/b.png"]),
        ]));
        let events_path = temp.path().join("events.jsonl");
        let history = GenerationHistory::in_output_dir(&temp.path().join("outputs"));
        let generator = generator(transport.clone(), temp.path())
            .with_events(EventWriter::new(&events_path, "session-1"))
            .with_history(history.clone());
        let request =
            GenerationRequest::new("小猫 xiǎo māo").with_aspect_ratio(AspectRatio::Portrait3x4);
        let mut observer = RecordingObserver::default();

        let image = generator.generate(
            &request,
            &OutputTarget::default().labelled(Some("animals".to_string())),
            &mut observer,
            &CancelToken::new(),
        )?;

        assert_eq!(image.job_id, "task-1");
        assert_eq!(image.url, "https://cdn.test/a.png");
        assert_eq!(image.bytes, PNG_BYTES.len() as u64);
        assert_eq!(image.sha256.len(), 64);
        assert_eq!(image.polls, 2);
        assert_eq!(image.discarded_urls.len(), 1);
        assert!(image.path.exists());
        assert_eq!(transport.create_count(), 1);
        assert_eq!(observer.closed, 1);

        let types: Vec<String> = read_events(&events_path)?
            .iter()
            .filter_map(|event| event.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec!["job_created", "job_polled", "job_polled", "job_succeeded", "artifact_saved"]
        );

        let entries = history.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label.as_deref(), Some("animals"));
        assert_eq!(entries[0].aspect_ratio, "3:4");
        assert_eq!(entries[0].sha256.as_deref(), Some(image.sha256.as_str()));
        Ok(())
    }

    #[test]
    fn failed_job_emits_job_failed_and_skips_download() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![failed("E1", "boom")]));
        let events_path = temp.path().join("events.jsonl");
        let generator = generator(transport.clone(), temp.path())
            .with_events(EventWriter::new(&events_path, "session-1"));

        let result = generator.generate(
            &GenerationRequest::new("prompt"),
            &OutputTarget::default(),
            &mut RecordingObserver::default(),
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(JobError::JobFailed { .. })));
        assert!(transport.downloads().is_empty());
        let events = read_events(&events_path)?;
        let last = events.last().ok_or_else(|| anyhow::anyhow!("no events"))?;
        assert_eq!(last["type"], "job_failed");
        assert_eq!(last["kind"], "job_failed");
        assert_eq!(last["job_id"], "task-1");
        assert_eq!(last["session_id"], "session-1");
        Ok(())
    }

    #[test]
    fn empty_prompt_is_rejected_before_any_poll() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![success(&["x/1.png"])]));
        let mut observer = RecordingObserver::default();

        let result = generator(transport.clone(), temp.path()).generate(
            &GenerationRequest::new("   "),
            &OutputTarget::default(),
            &mut observer,
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(JobError::InvalidRequest(_))));
        assert_eq!(transport.query_count(), 0);
        assert_eq!(observer.closed, 1);
        Ok(())
    }

    #[test]
    fn download_failure_leaves_no_history_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport =
            Arc::new(ScriptedTransport::new(vec![success(&["x/1.png"])]).failing_downloads());
        let history = GenerationHistory::in_output_dir(temp.path());
        let generator = generator(transport, temp.path()).with_history(history.clone());

        let result = generator.generate(
            &GenerationRequest::new("prompt"),
            &OutputTarget::at(temp.path().join("poster.png")),
            &mut RecordingObserver::default(),
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(JobError::Download { .. })));
        assert!(history.load().is_empty());
        assert!(!temp.path().join("poster.png").exists());
        Ok(())
    }

    #[test]
    fn observer_learns_the_job_id_before_the_first_poll() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![success(&["x/1.png"])]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut observer = RecordingObserver::default();

        let result = generator(transport.clone(), temp.path()).generate(
            &GenerationRequest::new("prompt"),
            &OutputTarget::default(),
            &mut observer,
            &cancel,
        );

        assert!(matches!(result, Err(JobError::Interrupted { .. })));
        assert_eq!(observer.created, vec!["task-1".to_string()]);
        assert!(observer.percents.is_empty());
        assert_eq!(transport.query_count(), 0);
        Ok(())
    }
}
