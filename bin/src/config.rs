//! leaderd configs

pub mod cli {
    //! Parse from either cli or env var

    /// default lease key
    pub static DEFAULT_LEASE_KEY: &str = "leaderd/leader";
    /// default lease TTL in seconds
    pub const DEFAULT_LEASE_TTL: u64 = 10;
    /// pause after a store error while acquiring
    pub const DEFAULT_PAUSE_INTERVAL_MS: u64 = 1_000;
    /// floor for the renewal poll interval
    pub const DEFAULT_MIN_RETRY_INTERVAL_MS: u64 = 100;
    /// use the in-memory store unless an etcd URL is given
    pub static DEFAULT_STORE: &str = "memory";
    /// per-request timeout for etcd calls (watches excluded)
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "leaderd-worker";
    /// default log level. Can use this argument or LEADERD_LOG env var
    pub const DEFAULT_LEADERD_LOG: &str = "info";
    use std::time::Duration;

    pub use clap::Parser;
    use super::trace::LogFormat;
    use leader_lease::{
        LeaseConfig,
        config::{DEFAULT_MAX_RETRIES, DEFAULT_WAIT_FRACTION},
    };

    #[derive(Parser, Debug, Clone, PartialEq)]
    #[clap(author, name = "leaderd", bin_name = "leaderd", about, long_about = None)]
    /// parses from cli & environment var. leaderd will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// key competed for in the store
        #[clap(long, env, value_parser, default_value = DEFAULT_LEASE_KEY)]
        pub lease_key: String,
        /// value identifying this candidate, a random uuid if unset
        #[clap(long, env, value_parser)]
        pub lease_value: Option<String>,
        /// lease TTL in seconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_LEASE_TTL)]
        pub lease_ttl: u64,
        /// fraction of the TTL to wait before renewing
        #[clap(long, env, value_parser, default_value_t = DEFAULT_WAIT_FRACTION)]
        pub wait_fraction: f64,
        /// pause after a store error while acquiring, in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PAUSE_INTERVAL_MS)]
        pub pause_interval_ms: u64,
        /// renewal polls per window, also the release retry budget
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MAX_RETRIES)]
        pub max_retries: u32,
        /// floor for the renewal poll interval, in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MIN_RETRY_INTERVAL_MS)]
        pub min_retry_interval_ms: u64,
        /// "memory" or the base URL of an etcd v2 endpoint, ex. "http://127.0.0.1:2379"
        #[clap(long, env, value_parser, default_value = DEFAULT_STORE)]
        pub store: String,
        /// timeout for etcd requests other than watches, in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
        pub request_timeout_ms: u64,
        /// number of tokio worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_LEADERD_LOG)]
        pub leaderd_log: String,
        /// log format
        #[clap(long, env, value_enum, default_value_t = LogFormat::Standard)]
        pub log_format: LogFormat,
    }

    impl Config {
        /// etcd request timeout as `Duration`
        pub fn request_timeout(&self) -> Duration {
            Duration::from_millis(self.request_timeout_ms)
        }

        /// is the in-memory store selected?
        pub fn is_memory_store(&self) -> bool {
            self.store.eq_ignore_ascii_case(DEFAULT_STORE)
        }

        /// Build the coordinator config. `value` is `lease_value` or the
        /// generated id that replaced it.
        pub fn lease_config(&self, value: String) -> LeaseConfig {
            LeaseConfig {
                wait_fraction: self.wait_fraction,
                pause_interval: Duration::from_millis(self.pause_interval_ms),
                max_retries: self.max_retries,
                min_retry_interval: Duration::from_millis(self.min_retry_interval_ms),
                ..LeaseConfig::new(&self.lease_key, value, self.lease_ttl)
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = Config::try_parse_from(["leaderd"]).unwrap();
            assert_eq!(config.lease_key, DEFAULT_LEASE_KEY);
            assert_eq!(config.lease_value, None);
            assert!(config.is_memory_store());
            assert_eq!(config.request_timeout(), Duration::from_secs(5));

            let lease = config.lease_config("a".into());
            assert_eq!(lease.value, "a");
            assert_eq!(lease.ttl, DEFAULT_LEASE_TTL);
            assert_eq!(lease.wait_fraction, DEFAULT_WAIT_FRACTION);
            assert_eq!(lease.max_retries, DEFAULT_MAX_RETRIES);
            assert_eq!(lease.min_retry_interval, Duration::from_millis(100));
            lease.validate().unwrap();
        }

        #[test]
        fn test_overrides() {
            let config = Config::try_parse_from([
                "leaderd",
                "--lease-key",
                "jobs/scheduler",
                "--lease-value",
                "node-1",
                "--lease-ttl",
                "20",
                "--wait-fraction",
                "0.5",
                "--pause-interval-ms",
                "250",
                "--max-retries",
                "4",
                "--store",
                "http://127.0.0.1:2379",
            ])
            .unwrap();
            assert!(!config.is_memory_store());
            assert_eq!(config.lease_value.as_deref(), Some("node-1"));

            let lease = config.lease_config("node-1".into());
            assert_eq!(lease.key, "jobs/scheduler");
            assert_eq!(lease.ttl, 20);
            assert_eq!(lease.pause_interval, Duration::from_millis(250));
            assert_eq!(lease.renewal_schedule(20).after, Duration::from_secs(10));
            assert_eq!(lease.max_retries, 4);
        }

        #[test]
        fn test_invalid_values_rejected() {
            assert!(Config::try_parse_from(["leaderd", "--lease-ttl", "soon"]).is_err());
            assert!(Config::try_parse_from(["leaderd", "--log-format", "yaml"]).is_err());
        }

        #[test]
        fn test_log_format() {
            let config = Config::try_parse_from(["leaderd"]).unwrap();
            assert_eq!(config.log_format, LogFormat::Standard);
            let config = Config::try_parse_from(["leaderd", "--log-format", "json"]).unwrap();
            assert_eq!(config.log_format, LogFormat::Json);
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use clap::ValueEnum;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// How log lines are rendered
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        /// unstructured, one line per event
        Standard,
        Json,
        Pretty,
    }

    /// Level filter from LEADERD_LOG, falling back to "info" when it does not parse
    pub fn filter(leaderd_log: &str) -> Result<EnvFilter> {
        Ok(EnvFilter::try_new(leaderd_log)
            .or_else(|_| EnvFilter::try_new("info"))?
            .add_directive("hyper=off".parse()?)
            .add_directive("reqwest=warn".parse()?))
    }

    /// Install the global subscriber
    pub fn init(leaderd_log: &str, format: LogFormat) -> Result<()> {
        let registry = tracing_subscriber::registry().with(filter(leaderd_log)?);
        match format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new()),
                )
                .init(),
            LogFormat::Standard => registry.with(fmt::layer()).init(),
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_filter_keeps_http_clients_quiet() {
            let filter = filter("debug").unwrap().to_string();
            assert!(filter.contains("hyper=off"));
            assert!(filter.contains("reqwest=warn"));
        }
    }
}
