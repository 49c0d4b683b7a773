#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use taskforge::scheduler::{DispatchOptions, KindTimeouts};
use taskforge::task::{BulkScrapeParams, ShellCommandParams, TaskParameters, UrlDownloadParams};

/// Parameters for a shell command with no working directory.
pub fn shell(command: &str) -> TaskParameters {
    ShellBuilder::new(command).build()
}

/// Parameters for a plain URL download.
pub fn download(url: &str) -> TaskParameters {
    DownloadBuilder::new(url).build()
}

/// Builder for `shell_command` parameters.
pub struct ShellBuilder {
    params: ShellCommandParams,
}

impl ShellBuilder {
    pub fn new(command: &str) -> Self {
        Self {
            params: ShellCommandParams {
                command: command.to_string(),
                working_dir: None,
            },
        }
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.params.working_dir = Some(dir.as_ref().display().to_string());
        self
    }

    pub fn build(self) -> TaskParameters {
        TaskParameters::ShellCommand(self.params)
    }
}

/// Builder for `url_download` parameters.
pub struct DownloadBuilder {
    params: UrlDownloadParams,
}

impl DownloadBuilder {
    pub fn new(url: &str) -> Self {
        Self {
            params: UrlDownloadParams {
                url: url.to_string(),
                output_path: None,
                expected_size: None,
                checksum: None,
            },
        }
    }

    pub fn output_path(mut self, name: &str) -> Self {
        self.params.output_path = Some(name.to_string());
        self
    }

    pub fn expected_size(mut self, size: u64) -> Self {
        self.params.expected_size = Some(size);
        self
    }

    pub fn checksum(mut self, hex: &str) -> Self {
        self.params.checksum = Some(hex.to_string());
        self
    }

    pub fn build(self) -> TaskParameters {
        TaskParameters::UrlDownload(self.params)
    }
}

/// Builder for `bulk_scrape` parameters.
#[derive(Default)]
pub struct ScrapeBuilder {
    params: BulkScrapeParams,
}

impl ScrapeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, url: &str) -> Self {
        self.params.targets.push(url.to_string());
        self
    }

    pub fn include(mut self, pattern: &str) -> Self {
        self.params.include.push(pattern.to_string());
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.params.exclude.push(pattern.to_string());
        self
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.params.parallelism = Some(n);
        self
    }

    /// Discover media on `url` (and, with `follow_links`, linked pages).
    pub fn start_url(mut self, url: &str) -> Self {
        self.params.start_url = Some(url.to_string());
        self
    }

    pub fn follow_links(mut self, depth: u32) -> Self {
        self.params.follow_links = true;
        self.params.depth = depth;
        self
    }

    pub fn limit_pages(mut self, n: usize) -> Self {
        self.params.limit_pages = Some(n);
        self
    }

    pub fn analyze_only(mut self) -> Self {
        self.params.analyze_only = true;
        self
    }

    pub fn build(self) -> TaskParameters {
        TaskParameters::BulkScrape(self.params)
    }
}

/// Builder for `DispatchOptions` with short test-friendly durations.
pub struct DispatchOptionsBuilder {
    options: DispatchOptions,
}

impl DispatchOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: DispatchOptions {
                max_concurrency: 2,
                backlog_limit: 16,
                retry_after: Duration::from_secs(1),
                grace_period: Duration::from_millis(200),
                timeouts: KindTimeouts {
                    url_download: Duration::from_secs(10),
                    bulk_scrape: Duration::from_secs(10),
                    shell_command: Duration::from_secs(10),
                },
            },
        }
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.options.max_concurrency = n;
        self
    }

    pub fn backlog_limit(mut self, n: usize) -> Self {
        self.options.backlog_limit = n;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.options.grace_period = grace;
        self
    }

    pub fn shell_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.shell_command = timeout;
        self
    }

    pub fn build(self) -> DispatchOptions {
        self.options
    }
}

impl Default for DispatchOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
