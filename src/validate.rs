//! Configuration validation and compilation
//!
//! [`validate`] checks every rule and reports all violations at once.
//! [`compile`] runs it and, when nothing is wrong, produces an
//! [`IngestPlan`]: the typed, immutable form of the configuration in which
//! the alert mode is a sum type and every cluster filter is already built.

use crate::config::{
    AlertsConfig, EventsConfig, IngestConfig, LogsConfig, ProjectConfig, ALERT_MODE_LISTEN,
    ALERT_MODE_POLL, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::error::{IngestError, Result, ValidationError, ValidationErrors};
use crate::filter::ClusterFilter;
use crate::retry::ExponentialBackoff;
use crate::types::Surface;
use std::path::PathBuf;
use std::time::Duration;

/// One monitored project with its compiled cluster filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSelector {
    pub name: String,
    pub filter: ClusterFilter,
    pub collect_audit_logs: bool,
}

impl ProjectSelector {
    pub fn from_config(config: &ProjectConfig) -> std::result::Result<Self, ValidationError> {
        let filter = ClusterFilter::build(&config.include_clusters, &config.exclude_clusters)
            .map_err(|_| ValidationError::ClusterConfig {
                scope: format!("project '{}'", config.name),
            })?;

        Ok(Self {
            name: config.name.clone(),
            filter,
            collect_audit_logs: config.collect_audit_logs,
        })
    }
}

/// One monitored organization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgSelector {
    pub id: String,
}

/// Pagination and schedule shared by polling sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub page_size: u32,
    /// 0 means unbounded
    pub max_pages: u32,
}

/// Alerts surface, by mode
#[derive(Debug, Clone)]
pub enum AlertSource {
    Poll(PollSource),
    Listen(ListenSource),
}

#[derive(Debug, Clone)]
pub struct PollSource {
    pub projects: Vec<ProjectSelector>,
    pub settings: PollSettings,
}

#[derive(Debug, Clone)]
pub struct ListenSource {
    pub endpoint: ListenEndpoint,
    pub secret: String,
    pub tls: Option<TlsFiles>,
    /// Applied to every webhook payload's `clusterName`
    pub filter: ClusterFilter,
}

/// A parsed `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    /// Empty means all interfaces
    pub host: String,
    pub port: u16,
}

impl ListenEndpoint {
    /// Split `host:port`, accepting bracketed IPv6 hosts and an empty host
    pub fn parse(endpoint: &str) -> std::result::Result<Self, String> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| "missing port in address".to_string())?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            inner
                .strip_suffix(']')
                .ok_or_else(|| "missing ']' in address".to_string())?
        } else if host.contains(':') {
            return Err("too many colons in address".to_string());
        } else {
            host
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}'", port))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Address string suitable for `TcpListener::bind`
    pub fn bind_addr(&self) -> String {
        match self.host.as_str() {
            "" => format!("0.0.0.0:{}", self.port),
            host if host.contains(':') => format!("[{}]:{}", host, self.port),
            host => format!("{}:{}", host, self.port),
        }
    }
}

impl std::fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.bind_addr())
    }
}

/// Certificate and key paths for the webhook listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogSource {
    pub projects: Vec<ProjectSelector>,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct EventSource {
    pub projects: Vec<ProjectSelector>,
    pub organizations: Vec<OrgSelector>,
    pub types: Vec<String>,
    pub settings: PollSettings,
}

/// Validated, typed configuration for the engine
#[derive(Debug, Clone)]
pub struct IngestPlan {
    pub alerts: Option<AlertSource>,
    pub logs: Option<LogSource>,
    pub events: Option<EventSource>,
    pub backoff: ExponentialBackoff,
    pub storage: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

/// Check every rule, returning all violations (empty when valid)
pub fn validate(config: &IngestConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_alerts(&config.alerts, &mut errors);
    validate_logs(&config.logs, &mut errors);
    if let Some(events) = &config.events {
        validate_events(events, &mut errors);
    }

    errors
}

/// Validate and build the typed plan
pub fn compile(config: &IngestConfig) -> Result<IngestPlan> {
    let errors = validate(config);
    if !errors.is_empty() {
        return Err(IngestError::Config(ValidationErrors(errors)));
    }

    let alerts = if config.alerts.enabled {
        Some(compile_alerts(&config.alerts)?)
    } else {
        None
    };

    let logs = if config.logs.enabled {
        Some(LogSource {
            projects: compile_projects(&config.logs.projects)?,
            interval: config.logs.poll_interval,
        })
    } else {
        None
    };

    let events = match &config.events {
        Some(events) => Some(EventSource {
            projects: compile_projects(&events.projects)?,
            organizations: events
                .organizations
                .iter()
                .map(|o| OrgSelector { id: o.id.clone() })
                .collect(),
            types: events.types.clone(),
            settings: poll_settings(events.poll_interval, events.page_size, events.max_pages),
        }),
        None => None,
    };

    Ok(IngestPlan {
        alerts,
        logs,
        events,
        backoff: ExponentialBackoff::from(&config.retry_on_failure),
        storage: config.storage.clone(),
        shutdown_grace: config.shutdown_grace,
    })
}

fn validate_alerts(alerts: &AlertsConfig, errors: &mut Vec<ValidationError>) {
    if !alerts.enabled {
        return;
    }

    match alerts.mode.as_str() {
        ALERT_MODE_LISTEN => validate_listen(alerts, errors),
        ALERT_MODE_POLL => {
            if alerts.projects.is_empty() {
                errors.push(ValidationError::NoProjects {
                    surface: Surface::Alerts,
                });
            }
            validate_paging(
                Surface::Alerts,
                alerts.poll_interval,
                alerts.page_size,
                alerts.max_pages,
                errors,
            );
            validate_projects(&alerts.projects, errors);
        }
        other => errors.push(ValidationError::UnrecognizedMode(other.to_string())),
    }
}

fn validate_listen(alerts: &AlertsConfig, errors: &mut Vec<ValidationError>) {
    if alerts.endpoint.is_empty() {
        errors.push(ValidationError::NoEndpoint);
    } else if let Err(reason) = ListenEndpoint::parse(&alerts.endpoint) {
        errors.push(ValidationError::InvalidEndpoint {
            endpoint: alerts.endpoint.clone(),
            reason,
        });
    }

    if alerts.secret.is_empty() {
        errors.push(ValidationError::NoSecret);
    }

    if let Some(tls) = &alerts.tls {
        if tls.cert_file.is_empty() {
            errors.push(ValidationError::NoCert);
        }
        if tls.key_file.is_empty() {
            errors.push(ValidationError::NoKey);
        }
    }

    if !alerts.include_clusters.is_empty() && !alerts.exclude_clusters.is_empty() {
        errors.push(ValidationError::ClusterConfig {
            scope: "alerts webhook".to_string(),
        });
    }
}

fn validate_logs(logs: &LogsConfig, errors: &mut Vec<ValidationError>) {
    if !logs.enabled {
        return;
    }

    if logs.projects.is_empty() {
        errors.push(ValidationError::NoProjects {
            surface: Surface::Logs,
        });
    }
    if logs.poll_interval.is_zero() {
        errors.push(ValidationError::PollInterval {
            surface: Surface::Logs,
        });
    }
    validate_projects(&logs.projects, errors);
}

fn validate_events(events: &EventsConfig, errors: &mut Vec<ValidationError>) {
    if events.projects.is_empty() && events.organizations.is_empty() {
        errors.push(ValidationError::NoEventSources);
    }
    validate_paging(
        Surface::Events,
        events.poll_interval,
        events.page_size,
        events.max_pages,
        errors,
    );
    validate_projects(&events.projects, errors);
}

fn validate_paging(
    surface: Surface,
    interval: Duration,
    page_size: i64,
    max_pages: i64,
    errors: &mut Vec<ValidationError>,
) {
    if interval.is_zero() {
        errors.push(ValidationError::PollInterval { surface });
    }
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        errors.push(ValidationError::PageSize {
            surface,
            value: page_size,
        });
    }
    if max_pages < 0 {
        errors.push(ValidationError::MaxPages {
            surface,
            value: max_pages,
        });
    }
}

fn validate_projects(projects: &[ProjectConfig], errors: &mut Vec<ValidationError>) {
    for project in projects {
        if let Err(e) = ProjectSelector::from_config(project) {
            errors.push(e);
        }
    }
}

fn compile_alerts(alerts: &AlertsConfig) -> Result<AlertSource> {
    if alerts.mode == ALERT_MODE_POLL {
        return Ok(AlertSource::Poll(PollSource {
            projects: compile_projects(&alerts.projects)?,
            settings: poll_settings(alerts.poll_interval, alerts.page_size, alerts.max_pages),
        }));
    }

    let endpoint = ListenEndpoint::parse(&alerts.endpoint).map_err(|reason| {
        invalid(ValidationError::InvalidEndpoint {
            endpoint: alerts.endpoint.clone(),
            reason,
        })
    })?;
    let filter = ClusterFilter::build(&alerts.include_clusters, &alerts.exclude_clusters)
        .map_err(|_| {
            invalid(ValidationError::ClusterConfig {
                scope: "alerts webhook".to_string(),
            })
        })?;

    Ok(AlertSource::Listen(ListenSource {
        endpoint,
        secret: alerts.secret.clone(),
        tls: alerts.tls.as_ref().map(|tls| TlsFiles {
            cert_file: PathBuf::from(&tls.cert_file),
            key_file: PathBuf::from(&tls.key_file),
        }),
        filter,
    }))
}

fn compile_projects(projects: &[ProjectConfig]) -> Result<Vec<ProjectSelector>> {
    projects
        .iter()
        .map(|p| ProjectSelector::from_config(p).map_err(invalid))
        .collect()
}

fn poll_settings(interval: Duration, page_size: i64, max_pages: i64) -> PollSettings {
    // Ranges were checked by validate()
    PollSettings {
        interval,
        page_size: page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE) as u32,
        max_pages: max_pages.clamp(0, u32::MAX as i64) as u32,
    }
}

fn invalid(error: ValidationError) -> IngestError {
    IngestError::Config(ValidationErrors(vec![error]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrgConfig, TlsConfig};

    fn listen_config() -> IngestConfig {
        let mut config = IngestConfig::default();
        config.alerts.enabled = true;
        config.alerts.mode = ALERT_MODE_LISTEN.to_string();
        config.alerts.endpoint = "localhost:7706".to_string();
        config.alerts.secret = "s3cret".to_string();
        config
    }

    fn poll_config(page_size: i64) -> IngestConfig {
        let mut config = IngestConfig::default();
        config.alerts.enabled = true;
        config.alerts.mode = ALERT_MODE_POLL.to_string();
        config.alerts.projects = vec![ProjectConfig::new("proj1")];
        config.alerts.page_size = page_size;
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&IngestConfig::default()).is_empty());
    }

    #[test]
    fn test_disabled_surfaces_skip_rules() {
        let mut config = IngestConfig::default();
        config.alerts.mode = "bogus".to_string();
        config.alerts.page_size = 0;
        config.logs.projects = vec![ProjectConfig::new("p").include(&["a"]).exclude(&["b"])];
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn test_listen_valid() {
        assert!(validate(&listen_config()).is_empty());
    }

    #[test]
    fn test_listen_no_secret() {
        let mut config = listen_config();
        config.alerts.secret = String::new();
        assert_eq!(validate(&config), vec![ValidationError::NoSecret]);

        // Regardless of other problems
        config.alerts.endpoint = "nonsense".to_string();
        assert!(validate(&config).contains(&ValidationError::NoSecret));
    }

    #[test]
    fn test_listen_malformed_endpoint() {
        let mut config = listen_config();
        config.alerts.endpoint = "localhost".to_string();
        let errors = validate(&config);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::InvalidEndpoint { .. }));
    }

    #[test]
    fn test_listen_empty_endpoint_reports_once() {
        let mut config = listen_config();
        config.alerts.endpoint = String::new();
        assert_eq!(validate(&config), vec![ValidationError::NoEndpoint]);
    }

    #[test]
    fn test_listen_accumulates_all_errors() {
        let mut config = listen_config();
        config.alerts.endpoint = "bad".to_string();
        config.alerts.secret = String::new();
        config.alerts.tls = Some(TlsConfig::default());

        let errors = validate(&config);
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::NoSecret));
        assert!(errors.contains(&ValidationError::NoCert));
        assert!(errors.contains(&ValidationError::NoKey));
    }

    #[test]
    fn test_listen_tls_complete() {
        let mut config = listen_config();
        config.alerts.tls = Some(TlsConfig {
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
        });
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn test_unrecognized_mode() {
        let mut config = listen_config();
        config.alerts.mode = "push".to_string();
        assert_eq!(
            validate(&config),
            vec![ValidationError::UnrecognizedMode("push".to_string())]
        );
    }

    #[test]
    fn test_poll_page_size_bounds() {
        assert!(validate(&poll_config(1)).is_empty());
        assert!(validate(&poll_config(500)).is_empty());

        for bad in [0, 501, -1] {
            let errors = validate(&poll_config(bad));
            assert_eq!(
                errors,
                vec![ValidationError::PageSize {
                    surface: Surface::Alerts,
                    value: bad
                }]
            );
        }
    }

    #[test]
    fn test_poll_requires_projects() {
        let mut config = poll_config(100);
        config.alerts.projects.clear();
        assert_eq!(
            validate(&config),
            vec![ValidationError::NoProjects {
                surface: Surface::Alerts
            }]
        );
    }

    #[test]
    fn test_poll_cluster_conflict_per_project() {
        let mut config = poll_config(0);
        config.alerts.projects = vec![
            ProjectConfig::new("ok").include(&["a"]),
            ProjectConfig::new("bad1").include(&["a"]).exclude(&["b"]),
            ProjectConfig::new("bad2").include(&["c"]).exclude(&["d"]),
        ];

        let errors = validate(&config);
        // page size and both conflicts, nothing short-circuited
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::ClusterConfig {
            scope: "project 'bad1'".to_string()
        }));
        assert!(errors.contains(&ValidationError::ClusterConfig {
            scope: "project 'bad2'".to_string()
        }));
    }

    #[test]
    fn test_poll_zero_interval_and_negative_max_pages() {
        let mut config = poll_config(100);
        config.alerts.poll_interval = Duration::ZERO;
        config.alerts.max_pages = -1;
        let errors = validate(&config);
        assert!(errors.contains(&ValidationError::PollInterval {
            surface: Surface::Alerts
        }));
        assert!(errors.contains(&ValidationError::MaxPages {
            surface: Surface::Alerts,
            value: -1
        }));
    }

    #[test]
    fn test_logs_rules() {
        let mut config = IngestConfig::default();
        config.logs.enabled = true;
        assert_eq!(
            validate(&config),
            vec![ValidationError::NoProjects {
                surface: Surface::Logs
            }]
        );

        config.logs.projects = vec![ProjectConfig::new("p").include(&["a"]).exclude(&["b"])];
        assert_eq!(validate(&config).len(), 1);
    }

    #[test]
    fn test_events_require_a_source() {
        let mut config = IngestConfig::default();
        config.events = Some(EventsConfig::default());
        assert_eq!(validate(&config), vec![ValidationError::NoEventSources]);

        config.events = Some(EventsConfig {
            organizations: vec![OrgConfig { id: "org".into() }],
            ..Default::default()
        });
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn test_errors_across_surfaces_accumulate() {
        let mut config = listen_config();
        config.alerts.secret = String::new();
        config.logs.enabled = true;
        config.events = Some(EventsConfig::default());

        let errors = validate(&config);
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_compile_listen_plan() {
        let mut config = listen_config();
        config.alerts.include_clusters = vec!["clusterA".into()];
        let plan = compile(&config).unwrap();

        match plan.alerts {
            Some(AlertSource::Listen(listen)) => {
                assert_eq!(listen.endpoint.host, "localhost");
                assert_eq!(listen.endpoint.port, 7706);
                assert_eq!(listen.secret, "s3cret");
                assert!(listen.filter.matches("clusterA"));
                assert!(!listen.filter.matches("clusterB"));
            }
            other => panic!("expected listen source, got {:?}", other),
        }
        assert!(plan.logs.is_none());
        assert!(plan.events.is_none());
    }

    #[test]
    fn test_compile_poll_plan() {
        let mut config = poll_config(100);
        config.alerts.max_pages = 0;
        config.alerts.projects = vec![ProjectConfig::new("proj1").exclude(&["clusterB"])];
        let plan = compile(&config).unwrap();

        let Some(AlertSource::Poll(poll)) = plan.alerts else {
            panic!("expected poll source");
        };
        assert_eq!(poll.settings.page_size, 100);
        assert_eq!(poll.settings.max_pages, 0);
        assert!(!poll.projects[0].filter.matches("clusterB"));
    }

    #[test]
    fn test_compile_reports_all_errors() {
        let mut config = listen_config();
        config.alerts.secret = String::new();
        config.alerts.endpoint = String::new();

        match compile(&config) {
            Err(IngestError::Config(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = ListenEndpoint::parse(":8080").unwrap();
        assert_eq!(ep.host, "");
        assert_eq!(ep.bind_addr(), "0.0.0.0:8080");

        let ep = ListenEndpoint::parse("[::1]:9000").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.bind_addr(), "[::1]:9000");

        assert!(ListenEndpoint::parse("localhost").is_err());
        assert!(ListenEndpoint::parse("::1:9000").is_err());
        assert!(ListenEndpoint::parse("host:http-alt").is_err());
        assert!(ListenEndpoint::parse("host:70000").is_err());
    }
}
