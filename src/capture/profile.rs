// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::Local;

use super::{object_key, shutdown::Completion, CaptureError, EventType, FlushError, ProfilerEngine};
use crate::{asprof::AsProfError, speedscope::SampleLog, store::ObjectStore};

/// The file async-profiler dumps collapsed stacks into. It is unlinked from
/// the start and reached through `/proc/self/fd`.
struct ProfileFile {
    file: std::fs::File,
}

impl ProfileFile {
    #[cfg(target_os = "linux")]
    fn new() -> Result<Self, io::Error> {
        Ok(Self {
            file: tempfile::tempfile()?,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn new() -> Result<Self, io::Error> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "async-profiler is only supported on Linux",
        ))
    }

    #[cfg(target_os = "linux")]
    fn path(&self) -> PathBuf {
        use std::os::fd::AsRawFd;

        format!("/proc/self/fd/{}", self.file.as_raw_fd()).into()
    }

    #[cfg(not(target_os = "linux"))]
    fn path(&self) -> PathBuf {
        let _ = &self.file;
        PathBuf::new()
    }
}

enum Status {
    Starting,
    Sampling(SystemTime),
    Stopped,
}

/// One running profiler. Buffers everything until completion, then writes a
/// single speedscope document. If it drops while sampling, it stops the
/// profiler and the samples are lost.
pub(crate) struct ProfilerSession {
    engine: Arc<dyn ProfilerEngine>,
    store: Arc<dyn ObjectStore>,
    destination: String,
    period: Duration,
    // this is only None once stopping the async-profiler failed
    output: Option<ProfileFile>,
    status: Status,
}

impl ProfilerSession {
    pub(crate) fn start(
        engine: Arc<dyn ProfilerEngine>,
        store: Arc<dyn ObjectStore>,
        destination: String,
        event: EventType,
        period: Duration,
    ) -> Result<Self, CaptureError> {
        let output = ProfileFile::new().map_err(CaptureError::TempFile)?;
        let path = output.path();
        let mut session = ProfilerSession {
            engine,
            store,
            destination,
            period,
            output: Some(output),
            status: Status::Starting,
        };
        // drop guard: the file is leaked if the profiler might have started
        session
            .engine
            .start(&path, event, period)
            .map_err(CaptureError::Engine)?;
        session.status = Status::Sampling(SystemTime::now());
        tracing::info!(
            message = "profiler started",
            destination = %session.destination,
            ?event,
            ?period,
        );
        Ok(session)
    }

    fn output_path(&self) -> Option<PathBuf> {
        self.output.as_ref().map(ProfileFile::path)
    }

    /// Returns when sampling began, or None if it was not sampling. Stopping
    /// is only attempted once, even if it fails.
    fn stop(&mut self) -> Result<Option<SystemTime>, AsProfError> {
        let (Status::Sampling(since), Some(path)) = (&self.status, self.output_path()) else {
            return Ok(None);
        };
        let since = *since;
        self.status = Status::Stopped;
        if let Err(err) = self.engine.stop(&path) {
            // SECURITY: avoid removing the output file if stopping the profiler fails,
            // to avoid symlink races
            std::mem::forget(self.output.take());
            return Err(err);
        }
        Ok(Some(since))
    }
}

#[async_trait]
impl Completion for ProfilerSession {
    fn name(&self) -> &str {
        &self.destination
    }

    async fn complete(self: Box<Self>) -> Result<(), FlushError> {
        let mut session = self;
        let Some(since) = session.stop().map_err(FlushError::Stop)? else {
            return Ok(());
        };
        let Some(path) = session.output_path() else {
            return Ok(());
        };
        let collapsed = tokio::fs::read(&path).await.map_err(FlushError::Read)?;
        let name = session.destination.clone();
        let period = session.period;
        let (body, samples) = tokio::task::spawn_blocking(move || {
            let log = SampleLog::from_collapsed(&String::from_utf8_lossy(&collapsed));
            serde_json::to_vec(&log.to_speedscope(&name, period)).map(|body| (body, log.sample_count()))
        })
        .await??;
        // the key is timestamped at flush time
        let key = object_key(&session.destination, &Local::now(), "json");
        tracing::debug!(
            message = "uploading profile",
            key = %key,
            samples,
            sampled_for = ?since.elapsed().unwrap_or_default(),
        );
        session
            .store
            .put(&key, body, "application/json")
            .await
            .map_err(|source| FlushError::StorageWrite { key, source })
    }
}

impl Drop for ProfilerSession {
    fn drop(&mut self) {
        match self.status {
            Status::Sampling(_) => {
                tracing::warn!(
                    destination = %self.destination,
                    "profiler session dropped before flushing, samples lost"
                );
                // XXX: Rust defines leaking resources during drop as safe.
                if let Err(err) = self.stop() {
                    tracing::warn!(?err, "unable to stop profiler during drop glue");
                }
            }
            Status::Stopped => {}
            Status::Starting => {
                // SECURITY: avoid removing the output file if stopping the profiler fails,
                // to avoid symlink races
                std::mem::forget(self.output.take());
            }
        }
    }
}
