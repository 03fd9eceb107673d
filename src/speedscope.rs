// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Conversion of async-profiler's collapsed stacks into the [speedscope]
//! file format.
//!
//! Collapsed stacks are one line per distinct stack, root frame first,
//! frames separated by `;`, followed by a space and the sample count:
//!
//! ```notrust
//! main;handle_request;parse_body 12
//! ```
//!
//! [speedscope]: https://www.speedscope.app/file-format-schema.json

use std::{collections::HashMap, time::Duration};

use serde::Serialize;

/// The `$schema` every document declares.
pub const SCHEMA: &str = "https://www.speedscope.app/file-format-schema.json";

/// A speedscope document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedscopeFile {
    /// Always [`SCHEMA`].
    #[serde(rename = "$schema")]
    pub schema: &'static str,
    /// Frames shared by every profile.
    pub shared: Shared,
    /// One profile per capture.
    pub profiles: Vec<SampledProfile>,
    /// Document name, the capture destination.
    pub name: String,
    /// Profile shown first.
    pub active_profile_index: usize,
    /// `async-profiler-s3@<version>`.
    pub exporter: String,
}

/// Data shared between the profiles of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shared {
    /// Every distinct frame, referred to by index.
    pub frames: Vec<Frame>,
}

/// A stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Function name as async-profiler reports it.
    pub name: String,
}

/// A profile of weighted stack samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledProfile {
    /// Always `sampled`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Profile name.
    pub name: String,
    /// Unit of the weights, `seconds`.
    pub unit: &'static str,
    /// Always 0.
    pub start_value: f64,
    /// Sum of the weights.
    pub end_value: f64,
    /// Indices into [`Shared::frames`], root first.
    pub samples: Vec<Vec<usize>>,
    /// One weight per sample.
    pub weights: Vec<f64>,
}

/// Stack samples with interned frames.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SampleLog {
    frames: Vec<String>,
    index: HashMap<String, usize>,
    stacks: Vec<(Vec<usize>, u64)>,
}

impl SampleLog {
    /// Parses collapsed stacks. Lines that don't end in a count are skipped.
    pub fn from_collapsed(collapsed: &str) -> Self {
        let mut log = SampleLog::default();
        for line in collapsed.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let Some((stack, count)) = line.rsplit_once(' ') else {
                tracing::debug!(message = "skipping collapsed line without count", line);
                continue;
            };
            let Ok(count) = count.parse::<u64>() else {
                tracing::debug!(message = "skipping collapsed line with bad count", line);
                continue;
            };
            log.push(stack.split(';'), count);
        }
        log
    }

    /// Adds `count` samples of a root-first stack.
    pub fn push<'a>(&mut self, stack: impl IntoIterator<Item = &'a str>, count: u64) {
        let stack = stack.into_iter().map(|frame| self.intern(frame)).collect();
        self.stacks.push((stack, count));
    }

    fn intern(&mut self, frame: &str) -> usize {
        if let Some(&i) = self.index.get(frame) {
            return i;
        }
        let i = self.frames.len();
        self.frames.push(frame.to_owned());
        self.index.insert(frame.to_owned(), i);
        i
    }

    /// True when no stack was recorded.
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Total number of samples across stacks.
    pub fn sample_count(&self) -> u64 {
        self.stacks.iter().map(|(_, count)| count).sum()
    }

    /// Each sample weighs one sampling `period`, in seconds.
    pub fn to_speedscope(&self, name: &str, period: Duration) -> SpeedscopeFile {
        let period = period.as_secs_f64();
        let weights: Vec<f64> = self
            .stacks
            .iter()
            .map(|(_, count)| *count as f64 * period)
            .collect();
        let end_value = weights.iter().sum();
        SpeedscopeFile {
            schema: SCHEMA,
            shared: Shared {
                frames: self
                    .frames
                    .iter()
                    .map(|name| Frame { name: name.clone() })
                    .collect(),
            },
            profiles: vec![SampledProfile {
                kind: "sampled",
                name: name.to_owned(),
                unit: "seconds",
                start_value: 0.0,
                end_value,
                samples: self.stacks.iter().map(|(stack, _)| stack.clone()).collect(),
                weights,
            }],
            name: name.to_owned(),
            active_profile_index: 0,
            exporter: concat!("async-profiler-s3@", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLAPSED: &str = "\
main;handle;parse 3
main;handle;render/html 1
not a sample line
main;idle 2
";

    #[test]
    fn test_collapsed_interns_frames() {
        let log = SampleLog::from_collapsed(COLLAPSED);
        assert_eq!(log.frames, ["main", "handle", "parse", "render/html", "idle"]);
        assert_eq!(
            log.stacks,
            [(vec![0, 1, 2], 3), (vec![0, 1, 3], 1), (vec![0, 4], 2)]
        );
        assert_eq!(log.sample_count(), 6);
    }

    #[test]
    fn test_empty_input() {
        let log = SampleLog::from_collapsed("\n\n");
        assert!(log.is_empty());
        let doc = log.to_speedscope("app/x", Duration::from_millis(1));
        assert_eq!(doc.profiles[0].end_value, 0.0);
        assert!(doc.profiles[0].samples.is_empty());
    }

    #[test]
    fn test_speedscope_document_shape() {
        let doc = SampleLog::from_collapsed(COLLAPSED)
            .to_speedscope("app/home/index", Duration::from_millis(10));
        let json: serde_json::Value = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["$schema"], SCHEMA);
        assert_eq!(json["activeProfileIndex"], 0);
        assert_eq!(json["shared"]["frames"][3]["name"], "render/html");
        let profile = &json["profiles"][0];
        assert_eq!(profile["type"], "sampled");
        assert_eq!(profile["unit"], "seconds");
        assert_eq!(profile["samples"][2], serde_json::json!([0, 4]));
        let end = profile["endValue"].as_f64().unwrap();
        assert!((end - 0.06).abs() < 1e-9, "{end}");
    }

    #[test]
    fn test_slashes_unescaped() {
        let doc = SampleLog::from_collapsed("a/b;c 1").to_speedscope("app/x", Duration::from_millis(1));
        let text = serde_json::to_string(&doc).unwrap();
        assert!(text.contains("\"a/b\""), "{text}");
        assert!(!text.contains("\\/"));
    }
}
