//! Configuration of the proxy, read from command line flags or the environment.
use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};

use clap::Args;

/// Worker count bounds for one backend, written as `backend=min:max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBounds {
    /// Backend identifier
    pub backend: String,
    /// Smallest allowed worker count
    pub min: u32,
    /// Largest allowed worker count
    pub max: u32,
}

impl FromStr for WorkerBounds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (backend, range) = s
            .split_once('=')
            .ok_or_else(|| format!("expected backend=min:max, got {s}"))?;
        let (min, max) = range
            .split_once(':')
            .ok_or_else(|| format!("expected min:max, got {range}"))?;
        let min: u32 = min.trim().parse().map_err(|err| format!("min: {err}"))?;
        let max: u32 = max.trim().parse().map_err(|err| format!("max: {err}"))?;
        if min > max {
            return Err(format!("min {min} is larger than max {max}"));
        }
        Ok(Self {
            backend: backend.trim().to_owned(),
            min,
            max,
        })
    }
}

/// Command line options of the proxy.
#[derive(Args, Debug, Clone)]
pub struct Opts {
    /// Port the HTTP API listens on.
    #[arg(long, env = "STAMPEDE_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Namespace load tests are created in.
    #[arg(long, env = "STAMPEDE_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Maximum number of load tests pending or running at once.
    #[arg(long, env = "MAX_LOAD_TESTS_RUN", default_value_t = 10)]
    pub max_load_tests_run: usize,

    /// Maximum number of load tests returned by one list call.
    #[arg(long, env = "MAX_LIST_LIMIT", default_value_t = 50)]
    pub max_list_limit: usize,

    /// Images clients may use as master or worker image overrides.
    #[arg(long, env = "ALLOWED_CUSTOM_IMAGES", value_delimiter = ',')]
    pub allowed_custom_images: Vec<String>,

    /// Backends to enable, all when empty.
    #[arg(long, env = "ENABLED_BACKENDS", value_delimiter = ',')]
    pub enabled_backends: Vec<String>,

    /// Worker count bounds per backend, e.g. `jmeter=1:20`.
    #[arg(long, env = "BACKEND_WORKERS", value_delimiter = ',')]
    pub backend_workers: Vec<WorkerBounds>,

    /// Seconds a load test may go without units before it is reported as errored.
    #[arg(long, env = "SCHEDULING_GRACE_SECS", default_value_t = 300)]
    pub scheduling_grace_secs: u64,

    /// Seconds after creation a load test that has not finished is reported as errored.
    #[arg(long, env = "RUN_DEADLINE_SECS", default_value_t = 3600)]
    pub run_deadline_secs: u64,

    /// Directory reports are stored in.
    #[arg(long, env = "REPORT_DIR", default_value = "/tmp/stampede-reports")]
    pub report_dir: PathBuf,
}

/// Limits enforced by admission, listing and status derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Maximum number of load tests pending or running at once.
    pub max_load_tests_run: usize,
    /// Maximum page size of a list.
    pub max_list_limit: usize,
    /// Images allowed as overrides.
    pub allowed_custom_images: BTreeSet<String>,
    /// How long a load test may go without units.
    pub scheduling_grace: Duration,
    /// How long a load test may take before it is considered errored.
    pub run_deadline: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_load_tests_run: 10,
            max_list_limit: 50,
            allowed_custom_images: BTreeSet::new(),
            scheduling_grace: Duration::from_secs(300),
            run_deadline: Duration::from_secs(3600),
        }
    }
}

impl From<&Opts> for Limits {
    fn from(value: &Opts) -> Self {
        Self {
            max_load_tests_run: value.max_load_tests_run,
            max_list_limit: value.max_list_limit.max(1),
            allowed_custom_images: value
                .allowed_custom_images
                .iter()
                .map(|image| image.trim().to_owned())
                .filter(|image| !image.is_empty())
                .collect(),
            scheduling_grace: Duration::from_secs(value.scheduling_grace_secs),
            run_deadline: Duration::from_secs(value.run_deadline_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        opts: Opts,
    }

    #[test]
    fn parse_worker_bounds() {
        assert_eq!(
            "jmeter=2:10".parse::<WorkerBounds>(),
            Ok(WorkerBounds {
                backend: "jmeter".to_owned(),
                min: 2,
                max: 10
            })
        );
        assert!("jmeter".parse::<WorkerBounds>().is_err());
        assert!("jmeter=10:2".parse::<WorkerBounds>().is_err());
        assert!("jmeter=a:2".parse::<WorkerBounds>().is_err());
    }

    #[test]
    fn limits_from_flags() {
        let cli = Cli::parse_from([
            "stampede-proxy",
            "--max-load-tests-run",
            "1",
            "--allowed-custom-images",
            "a/b:1, c/d:2",
            "--backend-workers",
            "fake=1:5,jmeter=1:20",
        ]);
        let limits = Limits::from(&cli.opts);
        assert_eq!(limits.max_load_tests_run, 1);
        assert_eq!(limits.max_list_limit, 50);
        assert!(limits.allowed_custom_images.contains("c/d:2"));
        assert_eq!(cli.opts.backend_workers.len(), 2);
    }
}
