// Copyright 2024 Event Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry logic for async calls

use std::time::Duration;

use backoff::backoff::Backoff;

/// A backoff policy that doubles a base interval on every retry
/// (`base * 2^(n-1)` for the n-th retry), until it exceeds the maximum
/// retry count.
#[derive(Debug)]
pub struct ExponentialWithMaxRetryCount {
    base: Duration,
    max_retry_count: usize,
    count: usize,
}

impl ExponentialWithMaxRetryCount {
    /// Creates a new exponential backoff with `base` interval and
    /// `max_retry_count` retries, after which we return `None` to indicate
    /// that we should stop retrying.
    pub fn new(base: Duration, max_retry_count: usize) -> Self {
        Self {
            base,
            max_retry_count,
            count: 0,
        }
    }
}

impl Backoff for ExponentialWithMaxRetryCount {
    fn next_backoff(&mut self) -> Option<Duration> {
        (self.count < self.max_retry_count).then(|| {
            let interval = self.base * 2u32.saturating_pow(self.count as u32);
            self.count += 1;
            interval
        })
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}
