// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use tokio::{
    runtime::Handle,
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use super::{shutdown::Completion, CaptureError, FlushError, DATE_FORMAT_DETAIL};
use crate::store::ObjectStore;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// An object that grows one line at a time. Object stores can't append, so
/// lines are spooled to an anonymous temp file and uploaded as one object.
pub(crate) struct AppendTarget {
    key: String,
    writer: BufWriter<File>,
}

impl AppendTarget {
    pub(crate) fn open(key: String) -> io::Result<Self> {
        Ok(AppendTarget {
            key,
            writer: BufWriter::new(tempfile::tempfile()?),
        })
    }

    pub(crate) fn append_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    /// Returns the key and everything appended so far.
    pub(crate) fn close(self) -> io::Result<(String, Vec<u8>)> {
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        Ok((self.key, body))
    }
}

/// `<timestamp>; <elapsed seconds>; <resident MiB>`
pub(crate) fn format_tick<Tz: TimeZone>(at: &DateTime<Tz>, elapsed: Duration, rss_bytes: u64) -> String
where
    Tz::Offset: fmt::Display,
{
    format!(
        "{}; {:.2}; {:.2}",
        at.format(DATE_FORMAT_DETAIL),
        elapsed.as_secs_f64(),
        rss_bytes as f64 / BYTES_PER_MIB
    )
}

#[cfg(target_os = "linux")]
pub(crate) fn resident_memory_bytes() -> io::Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    parse_vm_rss(&status)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no VmRSS in /proc/self/status"))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn resident_memory_bytes() -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resident memory is only read on Linux",
    ))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find_map(|line| line.strip_prefix("VmRSS:"))?;
    let kib: u64 = line.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kib * 1024)
}

/// A background task appending one line per period until completion.
pub(crate) struct TimerSession {
    key: String,
    store: Arc<dyn ObjectStore>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<AppendTarget>,
}

impl TimerSession {
    /// The target is opened now, so an unwritable spool fails here and not
    /// at the first tick.
    pub(crate) fn start(
        handle: &Handle,
        store: Arc<dyn ObjectStore>,
        key: String,
        period: Duration,
    ) -> Result<Self, CaptureError> {
        let target = AppendTarget::open(key.clone()).map_err(CaptureError::TempFile)?;
        let (stop, stopped) = oneshot::channel();
        let started = Instant::now();
        let task = handle.spawn(run_ticks(target, started, period, stopped));
        tracing::info!(message = "timer started", key = %key, ?period);
        Ok(TimerSession {
            key,
            store,
            stop: Some(stop),
            task,
        })
    }
}

async fn run_ticks(
    mut target: AppendTarget,
    started: Instant,
    period: Duration,
    mut stopped: oneshot::Receiver<()>,
) -> AppendTarget {
    let mut ticker = tokio::time::interval_at(started + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut memory_warned = false;
    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                let rss = resident_memory_bytes().unwrap_or_else(|err| {
                    if !memory_warned {
                        tracing::warn!(?err, "unable to read resident memory, reporting 0");
                        memory_warned = true;
                    }
                    0
                });
                let line = format_tick(&Local::now(), started.elapsed(), rss);
                if let Err(err) = target.append_line(&line) {
                    tracing::warn!(?err, key = %target.key, "unable to append timer line, stopping timer");
                    break;
                }
            }
        }
    }
    target
}

#[async_trait]
impl Completion for TimerSession {
    fn name(&self) -> &str {
        &self.key
    }

    async fn complete(self: Box<Self>) -> Result<(), FlushError> {
        let mut session = self;
        if let Some(stop) = session.stop.take() {
            // the task may already have ended on its own
            let _ = stop.send(());
        }
        let target = (&mut session.task).await?;
        let (key, body) = target.close().map_err(FlushError::Read)?;
        tracing::debug!(message = "uploading timer", key = %key, bytes = body.len());
        session
            .store
            .put(&key, body, "text/csv")
            .await
            .map_err(|source| FlushError::StorageWrite { key, source })
    }
}

impl Drop for TimerSession {
    fn drop(&mut self) {
        if self.stop.is_some() {
            tracing::warn!(key = %self.key, "timer session dropped before flushing, lines lost");
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;

    use super::*;

    #[test]
    fn test_format_tick() {
        let at = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 20, 16, 41, 24)
            .unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(
            format_tick(&at, Duration::from_millis(1234), 52_428_800),
            "2025-03-20T16:41:24.123456+02:00; 1.23; 50.00"
        );
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tcargo\nVmPeak:\t  900 kB\nVmRSS:\t    2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tcargo\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_of_this_process() {
        assert!(resident_memory_bytes().unwrap() > 0);
    }

    #[test]
    fn test_append_target_keeps_lines_in_order() {
        let mut target = AppendTarget::open("app/cron/2025-03-20_16:41:24.csv".to_owned()).unwrap();
        target.append_line("one").unwrap();
        target.append_line("two").unwrap();
        let (key, body) = target.close().unwrap();
        assert_eq!(key, "app/cron/2025-03-20_16:41:24.csv");
        assert_eq!(body, b"one\ntwo\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_stops_ticking() {
        let store: Arc<dyn ObjectStore> = Arc::new(crate::store::test::MemoryStore::default());
        let session = TimerSession::start(
            &Handle::current(),
            store,
            "t.csv".to_owned(),
            Duration::from_millis(100),
        )
        .unwrap();
        let abort = session.task.abort_handle();
        drop(session);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(abort.is_finished());
    }
}
