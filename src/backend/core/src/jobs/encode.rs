//! Character-frequency encode executor.
//!
//! The illustrative job type: encodes an input string as a frequency prefix
//! plus the base64 of the raw input, emitting the encoded output one
//! character at a time. The payload cursor records how much of the output
//! has already been produced and delivered, so a re-leased job resumes where
//! the previous attempt stopped instead of redelivering the prefix.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LonghaulError, Result};
use crate::jobs::executor::{JobExecutor, ProgressFn, SharedJob};
use crate::jobs::record::{JobPayload, JobType};

/// Executor for [`JobType::Encode`] jobs.
pub struct InputEncodeExecutor {
    /// Pause between emitted characters; zero disables pacing.
    step_delay: Duration,
}

impl InputEncodeExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for InputEncodeExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Encode `input` as `{count}{char}` pairs for each distinct non-space
/// character in ascending order, then `/`, then base64 of the raw input.
///
/// `"aab"` encodes to `"2a1b/YWFi"`.
pub fn build_encoded(input: &str) -> String {
    let mut counts: BTreeMap<char, usize> = BTreeMap::new();
    for character in input.chars() {
        if character == ' ' {
            continue;
        }
        *counts.entry(character).or_insert(0) += 1;
    }

    let mut encoded = String::new();
    for (character, count) in counts {
        encoded.push_str(&count.to_string());
        encoded.push(character);
    }

    encoded.push('/');
    encoded.push_str(&BASE64.encode(input.as_bytes()));
    encoded
}

#[async_trait]
impl JobExecutor for InputEncodeExecutor {
    fn job_type(&self) -> JobType {
        JobType::Encode
    }

    async fn execute(
        &self,
        job: SharedJob,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (input, mut cursor, mut produced) = {
            let job = job.lock();
            let JobPayload::Encode {
                input,
                cursor,
                produced,
            } = job.payload();
            (input.clone(), *cursor, produced.clone())
        };

        let expected: Vec<char> = build_encoded(&input).chars().collect();

        // A cursor that does not describe a prefix of the expected output is
        // stale (input changed, or corrupted checkpoint): start over.
        let prefix_matches = cursor <= expected.len()
            && produced.chars().count() == cursor
            && produced.chars().zip(expected.iter()).all(|(a, b)| a == *b);
        if !prefix_matches {
            cursor = 0;
            produced.clear();
            update_payload(&job, cursor, &produced);
        }

        while cursor < expected.len() {
            if cancel.is_cancelled() {
                return Err(LonghaulError::cancelled());
            }

            let character = expected[cursor];
            progress(serde_json::Value::String(character.to_string())).await?;

            cursor += 1;
            produced.push(character);
            update_payload(&job, cursor, &produced);

            if !self.step_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LonghaulError::cancelled()),
                    _ = tokio::time::sleep(self.step_delay) => {}
                }
            }
        }

        Ok(())
    }
}

fn update_payload(job: &SharedJob, cursor: usize, produced: &str) {
    let mut job = job.lock();
    let JobPayload::Encode {
        cursor: stored_cursor,
        produced: stored_produced,
        ..
    } = job.payload_mut();
    *stored_cursor = cursor;
    *stored_produced = produced.to_string();
}
