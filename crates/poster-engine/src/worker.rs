//! One OS thread per concurrent generation, reporting into a [`TaskRegistry`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use poster_contracts::options::GenerationRequest;
use poster_contracts::runs::registry::{TaskRegistry, TaskStatus};

use crate::cancel::CancelToken;
use crate::error::JobError;
use crate::progress::{ProgressObserver, ProgressUpdate};
use crate::{GeneratedImage, ImageGenerator, OutputTarget};

/// Starts `request` on a named worker thread.
///
/// The registry entry under `task_key` moves from `processing` to `success`
/// or `error`; the same outcome is returned through the join handle.
pub fn spawn_generation(
    generator: Arc<ImageGenerator>,
    registry: TaskRegistry,
    task_key: impl Into<String>,
    request: GenerationRequest,
    target: OutputTarget,
    cancel: CancelToken,
) -> io::Result<JoinHandle<Result<GeneratedImage, JobError>>> {
    let task_key = task_key.into();
    registry.set_status(
        &task_key,
        TaskStatus::Processing {
            progress: 0,
            state: "submitted".to_string(),
        },
    );
    let thread_name: String = format!("poster-gen-{task_key}")
        .chars()
        .filter(|ch| *ch != '\0')
        .collect();

    let spawn_registry = registry.clone();
    let spawn_key = task_key.clone();
    let spawned = thread::Builder::new().name(thread_name).spawn(move || {
        let mut observer = RegistryProgress {
            registry: spawn_registry.clone(),
            task_key: spawn_key.clone(),
        };
        let outcome = generator.generate(&request, &target, &mut observer, &cancel);
        let status = match &outcome {
            Ok(image) => TaskStatus::Success {
                output_path: image.path.to_string_lossy().to_string(),
            },
            Err(err) => TaskStatus::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        };
        spawn_registry.set_status(&spawn_key, status);
        outcome
    });

    if let Err(err) = &spawned {
        registry.set_status(
            &task_key,
            TaskStatus::Error {
                kind: "spawn".to_string(),
                message: format!("worker thread spawn failed: {err}"),
            },
        );
    }
    spawned
}

/// Publishes the job id as soon as it exists, then each poll as
/// `processing{progress, state}`.
struct RegistryProgress {
    registry: TaskRegistry,
    task_key: String,
}

impl ProgressObserver for RegistryProgress {
    fn on_created(&mut self, job_id: &str) {
        self.registry.set_job_id(&self.task_key, job_id);
    }

    fn on_poll(&mut self, update: &ProgressUpdate<'_>) {
        self.registry.set_status(
            &self.task_key,
            TaskStatus::Processing {
                progress: update.percent,
                state: update.state.to_string(),
            },
        );
    }
}
