//! The daemon's INI configuration file.
//!
//! ```ini
//! [syncqd]
//! read-only = false
//! job-softfail-delay = 300
//! logfile-name = /var/log/syncqd.log
//!
//! [provider]
//! token-url = https://login.example.org/oauth2/token
//! api-url = https://api.example.org/v1
//! client-id = syncqd
//! client-secret-file = /etc/syncqd/client-secret
//!
//! [database]
//! url = sqlite:///var/lib/syncqd/syncqd.db
//! ```
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::TimeDelta;
use config::{Config, File, FileFormat};
use serde::Deserialize;
use syncq::{config::QueueConfig, token::Credentials};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub syncqd: DaemonSection,
    pub provider: Option<ProviderSection>,
    pub database: DatabaseSection,
}

/// Keys of the `[syncqd]` section. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaemonSection {
    /// Days of activity covered by the offline activity report.
    pub activity_backlog: u32,
    pub job_softfail_delay: u64,
    pub job_softfail_threshold: u16,
    /// `0` lets a job run for as long as the worker takes.
    pub job_timeout: u64,
    pub read_only: bool,
    pub queue_min_delay: u64,
    pub queue_delay_normal: u64,
    pub queue_delay_offline: u64,
    pub queue_max_delay: Option<u64>,
    pub queue_warn_overflow: bool,
    pub queue_capacity: usize,
    pub queue_concurrency: usize,
    pub shutdown_grace: u64,
    pub stats_interval: u64,
    pub poll_interval: u64,
    pub token_expiration: u64,
    pub token_safety_margin: u64,
    pub credential_error_ceiling: usize,
    pub transient_error_ceiling: usize,
    pub error_window: u64,
    pub logfile_name: String,
    pub logmail: bool,
    pub logmail_delay: u64,
    /// Cron schedule of the queue cleaner.
    pub prune_schedule: String,
    /// Cron schedule of the offline report jobs.
    pub report_schedule: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            activity_backlog: 30,
            job_softfail_delay: 300,
            job_softfail_threshold: 4,
            job_timeout: 600,
            read_only: false,
            queue_min_delay: 2,
            queue_delay_normal: 10,
            queue_delay_offline: 30,
            queue_max_delay: None,
            queue_warn_overflow: true,
            queue_capacity: 500,
            queue_concurrency: 4,
            shutdown_grace: 30,
            stats_interval: 1800,
            poll_interval: 1,
            token_expiration: 86400,
            token_safety_margin: 60,
            credential_error_ceiling: 2,
            transient_error_ceiling: 4,
            error_window: 3600,
            logfile_name: String::new(),
            logmail: false,
            logmail_delay: 1800,
            prune_schedule: "0 30 3 * * *".to_owned(),
            report_schedule: "0 0 2 * * *".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderSection {
    pub token_url: String,
    pub api_url: String,
    pub client_id: String,
    pub client_secret_file: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl ProviderSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Reads the client secret, which is kept out of the configuration file.
    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        let secret = std::fs::read_to_string(&self.client_secret_file).with_context(|| {
            format!(
                "failed to read client secret from {}",
                self.client_secret_file.display()
            )
        })?;
        let client_secret = secret.trim().to_owned();
        if client_secret.is_empty() {
            bail!(
                "client secret file {} is empty",
                self.client_secret_file.display()
            );
        }
        Ok(Credentials {
            client_id: self.client_id.clone(),
            client_secret,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite://syncqd.db".to_owned(),
        }
    }
}

/// Ten years. Longer durations overflow timestamp arithmetic or make no sense for a daemon.
const MAX_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

fn seconds(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::from_builder(Config::builder().add_source(File::from(path).format(FileFormat::Ini)))
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    }

    pub fn parse(ini: &str) -> anyhow::Result<Self> {
        Self::from_builder(Config::builder().add_source(File::from_str(ini, FileFormat::Ini)))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let section = &self.syncqd;
        let durations = [
            ("job-softfail-delay", Some(section.job_softfail_delay)),
            ("job-timeout", Some(section.job_timeout)),
            ("queue-min-delay", Some(section.queue_min_delay)),
            ("queue-delay-normal", Some(section.queue_delay_normal)),
            ("queue-delay-offline", Some(section.queue_delay_offline)),
            ("queue-max-delay", section.queue_max_delay),
            ("shutdown-grace", Some(section.shutdown_grace)),
            ("stats-interval", Some(section.stats_interval)),
            ("poll-interval", Some(section.poll_interval)),
            ("token-expiration", Some(section.token_expiration)),
            ("token-safety-margin", Some(section.token_safety_margin)),
            ("error-window", Some(section.error_window)),
            ("logmail-delay", Some(section.logmail_delay)),
            (
                "request-timeout",
                self.provider.as_ref().map(|provider| provider.request_timeout),
            ),
        ];
        for (key, value) in durations {
            if value.is_some_and(|value| value > MAX_SECONDS) {
                bail!("{key} must not exceed {MAX_SECONDS} seconds");
            }
        }
        if section.poll_interval == 0 {
            bail!("poll-interval must be at least 1");
        }
        if section.job_softfail_threshold == 0 {
            bail!("job-softfail-threshold must be at least 1");
        }
        if section.queue_concurrency == 0 {
            bail!("queue-concurrency must be at least 1");
        }
        if section.queue_capacity == 0 {
            bail!("queue-capacity must be at least 1");
        }
        if section.queue_max_delay.is_some_and(|max| max < section.queue_min_delay) {
            bail!("queue-max-delay must not be shorter than queue-min-delay");
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        let section = &self.syncqd;
        QueueConfig {
            stats_interval: Duration::from_secs(section.stats_interval),
            ..QueueConfig::default()
        }
        .with_delays(
            seconds(section.queue_min_delay),
            seconds(section.queue_delay_normal),
            seconds(section.queue_delay_offline),
        )
        .with_max_delay(section.queue_max_delay.map(seconds))
        .with_softfail(
            seconds(section.job_softfail_delay),
            section.job_softfail_threshold,
        )
        .with_capacity(section.queue_capacity, section.queue_warn_overflow)
        .with_read_only(section.read_only)
        .with_concurrency(section.queue_concurrency)
        .with_job_timeout((section.job_timeout > 0).then(|| Duration::from_secs(section.job_timeout)))
        .with_shutdown_grace(Duration::from_secs(section.shutdown_grace))
        .with_poll_interval(Duration::from_secs(section.poll_interval))
        .with_error_ceilings(
            seconds(section.error_window),
            section.credential_error_ceiling,
            section.transient_error_ceiling,
        )
    }

    pub fn token_lifetime(&self) -> TimeDelta {
        seconds(self.syncqd.token_expiration)
    }

    pub fn token_safety_margin(&self) -> TimeDelta {
        seconds(self.syncqd.token_safety_margin)
    }

    pub fn logmail_delay(&self) -> TimeDelta {
        seconds(self.syncqd.logmail_delay)
    }

    pub fn logfile(&self) -> Option<&Path> {
        let name = self.syncqd.logfile_name.trim();
        (!name.is_empty()).then(|| Path::new(name))
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use syncq::job::JobClass;
    use tempfile::NamedTempFile;

    use super::*;

    const FULL: &str = "
[syncqd]
activity-backlog = 14
job-softfail-delay = 120
job-softfail-threshold = 6
job-timeout = 0
read-only = true
queue-min-delay = 1
queue-delay-normal = 5
queue-delay-offline = 60
queue-max-delay = 3600
queue-capacity = 50
queue-concurrency = 2
logfile-name = /var/log/syncqd.log
logmail = true

[provider]
token-url = https://login.example.org/token
api-url = https://api.example.org/v1
client-id = syncqd
client-secret-file = /etc/syncqd/secret

[database]
url = sqlite:///var/lib/syncqd/jobs.db
";

    #[test]
    fn empty_file_uses_defaults() {
        let config = DaemonConfig::parse("").unwrap();

        assert!(config.provider.is_none());
        assert_eq!(config.database.url, "sqlite://syncqd.db");
        assert_eq!(config.logfile(), None);
        assert_eq!(config.queue_config(), QueueConfig::default());
        assert_eq!(config.token_lifetime(), TimeDelta::days(1));
    }

    #[test]
    fn reads_all_sections() {
        let config = DaemonConfig::parse(FULL).unwrap();

        assert_eq!(config.syncqd.activity_backlog, 14);
        assert!(config.syncqd.logmail);
        assert_eq!(config.logfile(), Some(Path::new("/var/log/syncqd.log")));
        assert_eq!(config.database.url, "sqlite:///var/lib/syncqd/jobs.db");

        let provider = config.provider.unwrap();
        assert_eq!(provider.client_id, "syncqd");
        assert_eq!(provider.request_timeout(), Duration::from_secs(30));
        assert_eq!(
            provider.client_secret_file,
            PathBuf::from("/etc/syncqd/secret")
        );
    }

    #[test]
    fn maps_to_queue_config() {
        let queue = DaemonConfig::parse(FULL).unwrap().queue_config();

        assert_eq!(queue.softfail_delay, TimeDelta::seconds(120));
        assert_eq!(queue.softfail_threshold, 6);
        assert_eq!(queue.job_timeout, None);
        assert!(queue.read_only);
        assert_eq!(queue.delay_for(JobClass::Immediate), TimeDelta::seconds(1));
        assert_eq!(queue.delay_for(JobClass::Normal), TimeDelta::seconds(5));
        assert_eq!(queue.delay_for(JobClass::Offline), TimeDelta::seconds(60));
        assert_eq!(queue.max_delay, Some(TimeDelta::hours(1)));
        assert_eq!(queue.capacity, 50);
        assert_eq!(queue.concurrency, 2);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(DaemonConfig::parse("[syncqd]\njob-softfail-threshold = 0\n").is_err());
        assert!(DaemonConfig::parse("[syncqd]\nqueue-concurrency = 0\n").is_err());
        assert!(DaemonConfig::parse("[syncqd]\nqueue-max-delay = 1\nqueue-min-delay = 2\n").is_err());
        assert!(DaemonConfig::parse("[syncqd]\nread-only = perhaps\n").is_err());
        assert!(DaemonConfig::parse("[syncqd]\npoll-interval = 0\n").is_err());
    }

    #[test]
    fn rejects_oversized_durations() {
        for key in [
            "job-softfail-delay",
            "job-timeout",
            "queue-max-delay",
            "stats-interval",
            "token-expiration",
            "error-window",
            "logmail-delay",
        ] {
            let ini = format!("[syncqd]\n{key} = 99999999999999\n");
            let error = DaemonConfig::parse(&ini).unwrap_err();
            assert!(error.to_string().contains(key), "{key}: {error}");
        }

        let ten_years = format!("[syncqd]\ntoken-expiration = {MAX_SECONDS}\n");
        let config = DaemonConfig::parse(&ten_years).unwrap();
        assert_eq!(config.token_lifetime(), TimeDelta::days(3650));
    }

    #[test]
    fn oversized_request_timeout_is_rejected() {
        let ini = "[provider]
token-url = https://login.example.org/token
api-url = https://api.example.org/v1
client-id = syncqd
client-secret-file = /etc/syncqd/secret
request-timeout = 99999999999999
";

        assert!(DaemonConfig::parse(ini).is_err());
    }

    #[test]
    fn provider_section_requires_urls() {
        assert!(DaemonConfig::parse("[provider]\nclient-id = syncqd\n").is_err());
    }

    #[test]
    fn client_secret_is_trimmed() {
        let mut secret = NamedTempFile::new().unwrap();
        writeln!(secret, "s3cret").unwrap();
        let provider = ProviderSection {
            token_url: "https://login.example.org/token".to_owned(),
            api_url: "https://api.example.org".to_owned(),
            client_id: "syncqd".to_owned(),
            client_secret_file: secret.path().to_owned(),
            request_timeout: 30,
        };

        let credentials = provider.credentials().unwrap();
        secret.close().unwrap();

        assert_eq!(credentials.client_secret, "s3cret");
        assert!(provider.credentials().is_err());
    }
}
