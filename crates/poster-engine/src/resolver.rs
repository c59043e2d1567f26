use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use poster_contracts::options::OutputFormat;

use crate::client::JobTransport;
use crate::error::JobError;
use crate::waiter::JobResult;

const MAX_NAME_ATTEMPTS: u32 = 1_000;

/// Where an artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub url: String,
    pub bytes: u64,
    pub discarded_urls: Vec<String>,
}

/// Turns a finished job into a file on disk.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    output_dir: PathBuf,
}

impl ArtifactResolver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Decodes `resultJson` and returns its non-blank URLs, in service order.
    pub fn result_urls(result: &JobResult) -> Result<Vec<String>, JobError> {
        let payload = result
            .record
            .decode_result()
            .map_err(|err| JobError::MalformedResult {
                job_id: result.job_id.to_string(),
                detail: err.to_string(),
            })?;
        let urls: Vec<String> = payload
            .as_ref()
            .map(|payload| payload.usable_urls())
            .unwrap_or_default()
            .into_iter()
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            return Err(JobError::EmptyResult {
                job_id: result.job_id.to_string(),
            });
        }
        Ok(urls)
    }

    /// Downloads the first result URL to `destination`, or to a fresh
    /// `generated_<unix>.<ext>` under the output directory.
    pub fn resolve(
        &self,
        transport: &dyn JobTransport,
        result: &JobResult,
        destination: Option<&Path>,
        format: OutputFormat,
    ) -> Result<ResolvedArtifact, JobError> {
        let mut urls = Self::result_urls(result)?.into_iter();
        let Some(url) = urls.next() else {
            return Err(JobError::EmptyResult {
                job_id: result.job_id.to_string(),
            });
        };
        let discarded_urls: Vec<String> = urls.collect();
        if !discarded_urls.is_empty() {
            tracing::warn!(
                job_id = %result.job_id,
                discarded = discarded_urls.len(),
                "job returned several artifacts; keeping the first"
            );
        }

        let path = match destination {
            Some(path) => path.to_path_buf(),
            None => self.next_output_path(format)?,
        };
        let bytes = transport.download_artifact(&url, &path)?;
        tracing::info!(job_id = %result.job_id, path = %path.display(), bytes, "artifact saved");
        Ok(ResolvedArtifact {
            path,
            url,
            bytes,
            discarded_urls,
        })
    }

    fn next_output_path(&self, format: OutputFormat) -> Result<PathBuf, JobError> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|err| JobError::io(&self.output_dir, err))?;
        let stem = format!("generated_{}", Utc::now().timestamp());
        let ext = format.extension();
        let first = self.output_dir.join(format!("{stem}.{ext}"));
        if !first.exists() {
            return Ok(first);
        }
        (1..MAX_NAME_ATTEMPTS)
            .map(|n| self.output_dir.join(format!("{stem}_{n}.{ext}")))
            .find(|candidate| !candidate.exists())
            .ok_or_else(|| {
                JobError::io(
                    &first,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "no free output file name",
                    ),
                )
            })
    }
}
