//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `linewatch.toml` and deserializes into strongly-typed structs.
//! Every section has defaults, so a missing file or an empty one yields
//! a working configuration with no sources. Secrets (API keys) are
//! referenced by env-var name and resolved at startup into
//! `SecretString`s that only the request builder exposes.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::fetch::{CircuitConfig, FetchConfig};
use crate::scheduler::BackoffPolicy;
use crate::sources::mappers::UnknownPeriod;
use crate::storage::RetentionPolicy;
use crate::types::{LinewatchError, MarketKind};

/// Default config file path.
pub const DEFAULT_CONFIG_FILE: &str = "linewatch.toml";

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub http: HttpConfig,
    pub circuit: CircuitSettings,
    pub scheduler: SchedulerConfig,
    pub consensus: ConsensusSettings,
    pub normalization: NormalizationConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub quotes_ttl_days: u32,
    pub ev_hits_ttl_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "linewatch.db".to_string(),
            quotes_ttl_days: 14,
            ev_hits_ttl_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub base_backoff: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    pub validator_cache: String,
    pub respect_robots: bool,
    #[serde(with = "duration_str")]
    pub robots_ttl: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: "linewatch/0.1".to_string(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            validator_cache: crate::fetch::validators::DEFAULT_CACHE_FILE.to_string(),
            respect_robots: true,
            robots_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub fail_threshold: usize,
    #[serde(with = "duration_str")]
    pub window: Duration,
    #[serde(with = "duration_str")]
    pub cool_off: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let c = CircuitConfig::default();
        Self {
            fail_threshold: c.fail_threshold,
            window: c.window,
            cool_off: c.cool_off,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration_str")]
    pub default_cadence: Duration,
    pub kill_switch: String,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub sweep_cadence: Duration,
    pub backoff: BackoffSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_cadence: Duration::from_secs(600),
            kill_switch: ".kill".to_string(),
            poll_interval: Duration::from_secs(1),
            sweep_cadence: Duration::from_secs(3600),
            backoff: BackoffSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    #[serde(with = "duration_str")]
    pub initial: Duration,
    pub factor: f64,
    #[serde(with = "duration_str")]
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        let p = BackoffPolicy::default();
        Self {
            initial: p.initial,
            factor: p.factor,
            max: p.max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    pub edge_threshold: f64,
    pub min_books: usize,
    #[serde(with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub max_quote_age: Option<Duration>,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            edge_threshold: 0.02,
            min_books: 1,
            max_quote_age: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub unknown_period: UnknownPeriod,
}

/// One bookmaker source and its feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Duration>,
    /// Mapper name; defaults to the source key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Name of the env var holding the API key, sent as `X-API-Key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Base URL for feeds addressed by competition key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub market_map: BTreeMap<MarketKind, Vec<String>>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub sport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub league: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competition_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub markets: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl FeedConfig {
    /// Request URL and league label for this feed. Feeds name either a
    /// full `url` or a `competition_key` under the source's `api_base`.
    pub fn resolve(&self, api_base: Option<&str>) -> Result<(String, String), LinewatchError> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            let league = self.league.clone().unwrap_or_default();
            return Ok((url.trim().to_string(), league));
        }

        let comp = self
            .competition_key
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LinewatchError::Config("feed needs a url or competition_key".to_string()))?;
        let base = api_base
            .ok_or_else(|| LinewatchError::Config(format!("feed {comp} needs the source's api_base")))?;
        if self.markets.is_empty() {
            return Err(LinewatchError::Config(format!("feed {comp} lists no markets")));
        }

        let query: Vec<String> = self
            .markets
            .iter()
            .map(|m| format!("markets={}", urlencoding::encode(m)))
            .collect();
        let url = format!(
            "{}/competitions/{}?{}",
            base.trim_end_matches('/'),
            urlencoding::encode(comp),
            query.join("&")
        );
        let league = self
            .league
            .clone()
            .unwrap_or_else(|| comp.rsplit('-').next().unwrap_or(comp).to_string());
        Ok((url, league))
    }
}

impl SourceConfig {
    pub fn mapper_name(&self) -> &str {
        self.mapper.as_deref().unwrap_or(&self.key)
    }

    /// Resolve `api_key_env` to the secret it names.
    pub fn api_key(&self) -> Result<Option<SecretString>, LinewatchError> {
        match &self.api_key_env {
            None => Ok(None),
            Some(name) => AppConfig::resolve_env(name)
                .map(|v| Some(SecretString::new(v)))
                .map_err(|e| LinewatchError::Config(format!("source {}: {e}", self.key))),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults. Env
    /// overrides are applied either way.
    pub fn load_or_default(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::load(path)?
        } else {
            tracing::info!(path, "No config file found, using defaults");
            Self::default()
        };
        config.apply_overrides(|k| std::env::var(k).ok())?;
        Ok(config)
    }

    /// Apply `LINEWATCH_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("LINEWATCH_DB_PATH") {
            self.store.path = v;
        }
        if let Some(v) = lookup("LINEWATCH_USER_AGENT") {
            self.http.user_agent = v;
        }
        if let Some(v) = lookup("LINEWATCH_KILL_SWITCH") {
            self.scheduler.kill_switch = v;
        }
        if let Some(v) = lookup("LINEWATCH_QUOTES_TTL_DAYS") {
            self.store.quotes_ttl_days = v
                .parse()
                .with_context(|| format!("Invalid LINEWATCH_QUOTES_TTL_DAYS: {v}"))?;
        }
        if let Some(v) = lookup("LINEWATCH_EV_HITS_TTL_DAYS") {
            self.store.ev_hits_ttl_days = v
                .parse()
                .with_context(|| format!("Invalid LINEWATCH_EV_HITS_TTL_DAYS: {v}"))?;
        }
        if let Some(v) = lookup("LINEWATCH_EDGE_THRESHOLD") {
            self.consensus.edge_threshold = v
                .parse()
                .with_context(|| format!("Invalid LINEWATCH_EDGE_THRESHOLD: {v}"))?;
        }
        Ok(())
    }

    /// Globally required settings. Per-source problems are reported when
    /// the registry is built and only disable that source.
    pub fn validate(&self) -> Result<(), LinewatchError> {
        if self.http.max_attempts == 0 {
            return Err(LinewatchError::Config("http.max_attempts must be at least 1".into()));
        }
        if self.circuit.fail_threshold == 0 {
            return Err(LinewatchError::Config("circuit.fail_threshold must be at least 1".into()));
        }
        if self.scheduler.backoff.factor < 1.0 || !self.scheduler.backoff.factor.is_finite() {
            return Err(LinewatchError::Config("scheduler.backoff.factor must be >= 1".into()));
        }
        if self.scheduler.default_cadence.is_zero() || self.scheduler.poll_interval.is_zero() {
            return Err(LinewatchError::Config(
                "scheduler cadence and poll_interval must be non-zero".into(),
            ));
        }
        let backoff = &self.scheduler.backoff;
        if backoff.initial.is_zero() || backoff.max.is_zero() {
            return Err(LinewatchError::Config(
                "scheduler.backoff initial and max must be non-zero".into(),
            ));
        }
        if backoff.max < backoff.initial {
            return Err(LinewatchError::Config(
                "scheduler.backoff.max must be >= scheduler.backoff.initial".into(),
            ));
        }
        if self.scheduler.sweep_cadence.is_zero() {
            return Err(LinewatchError::Config("scheduler.sweep_cadence must be non-zero".into()));
        }
        for s in &self.sources {
            if s.cadence.is_some_and(|c| c.is_zero()) {
                return Err(LinewatchError::Config(format!("source {}: cadence must be non-zero", s.key)));
            }
        }
        check_edge_threshold(self.consensus.edge_threshold)?;
        let mut seen = std::collections::HashSet::new();
        for s in &self.sources {
            if !seen.insert(s.key.as_str()) {
                return Err(LinewatchError::Config(format!("duplicate source key: {}", s.key)));
            }
        }
        Ok(())
    }

    pub fn source(&self, key: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.key == key)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.http.user_agent.clone(),
            timeout: self.http.timeout,
            max_attempts: self.http.max_attempts,
            base_backoff: self.http.base_backoff,
            max_backoff: self.http.max_backoff,
            respect_robots: self.http.respect_robots,
            robots_ttl: self.http.robots_ttl,
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            fail_threshold: self.circuit.fail_threshold,
            window: self.circuit.window,
            cool_off: self.circuit.cool_off,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.scheduler.backoff.initial,
            factor: self.scheduler.backoff.factor,
            max: self.scheduler.backoff.max,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            quotes_ttl_days: self.store.quotes_ttl_days,
            ev_hits_ttl_days: self.store.ev_hits_ttl_days,
        }
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse `"500ms"`, `"30s"`, `"10m"`, `"1h"`, `"2d"` or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, LinewatchError> {
    let s = s.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| LinewatchError::Config(format!("invalid duration: {s:?}")))?;
    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86_400.0,
        other => {
            return Err(LinewatchError::Config(format!(
                "invalid duration unit {other:?} in {s:?}"
            )))
        }
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(LinewatchError::Config(format!("invalid duration: {s:?}")));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Minimum EV for a hit. Must be finite and not negative.
pub fn check_edge_threshold(edge: f64) -> Result<(), LinewatchError> {
    if !edge.is_finite() || edge < 0.0 {
        return Err(LinewatchError::Config(format!(
            "edge threshold must be a finite, non-negative number, got {edge}"
        )));
    }
    Ok(())
}

/// Render a duration in the largest whole unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Durations as strings (`"30s"`) or bare seconds.
mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Raw {
        Secs(u64),
        Text(String),
    }

    pub(super) fn from_raw<E: de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => super::parse_duration(&s).map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        from_raw(Raw::deserialize(d)?)
    }
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    use super::duration_str::{from_raw, Raw};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<Raw>::deserialize(d)?.map(from_raw).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10 weeks").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.store.quotes_ttl_days, 14);
        assert!(cfg.http.respect_robots);
        assert_eq!(cfg.fetch_config().robots_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.http.max_attempts, 3);
        assert_eq!(cfg.circuit.fail_threshold, 5);
        assert_eq!(cfg.scheduler.default_cadence, Duration::from_secs(600));
        assert_eq!(cfg.scheduler.backoff.initial, Duration::from_secs(30));
        assert_eq!(cfg.scheduler.backoff.max, Duration::from_secs(600));
        assert!((cfg.consensus.edge_threshold - 0.02).abs() < 1e-12);
        assert_eq!(cfg.normalization.unknown_period, UnknownPeriod::AssumeFullTime);
        assert!(cfg.sources.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_full_config_parses() {
        let toml_str = r#"
            [store]
            path = "/tmp/lw.db"

            [circuit]
            fail_threshold = 3
            window = "30s"
            cool_off = 60

            [scheduler.backoff]
            initial = "15s"
            factor = 3.0
            max = "5m"

            [consensus]
            edge_threshold = 0.05
            max_quote_age = "2m"

            [normalization]
            unknown_period = "skip"

            [[sources]]
            key = "bovada"
            cadence = "5m"
            no_cache = true
            [sources.market_map]
            FT_ML_2W = ["moneyline", "winner"]
            [[sources.feeds]]
            url = "https://bovada.example/coupon/soccer"
            sport = "soccer"
            league = "EPL"

            [[sources]]
            key = "cloudbet"
            enabled = false
            api_key_env = "CLOUDBET_API_KEY"
            api_base = "https://cloudbet.example/pub/v2/odds"
            [[sources.feeds]]
            sport = "soccer"
            competition_key = "soccer-england-premier-league"
            markets = ["soccer.matchOdds"]
        "#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.circuit.window, Duration::from_secs(30));
        assert_eq!(cfg.circuit.cool_off, Duration::from_secs(60));
        assert!((cfg.scheduler.backoff.factor - 3.0).abs() < 1e-12);
        assert_eq!(cfg.consensus.max_quote_age, Some(Duration::from_secs(120)));
        assert_eq!(cfg.normalization.unknown_period, UnknownPeriod::Skip);

        let bovada = cfg.source("bovada").unwrap();
        assert!(bovada.enabled);
        assert!(bovada.no_cache);
        assert_eq!(bovada.cadence, Some(Duration::from_secs(300)));
        assert_eq!(bovada.mapper_name(), "bovada");
        assert_eq!(bovada.market_map[&MarketKind::Moneyline].len(), 2);

        let cloudbet = cfg.source("cloudbet").unwrap();
        assert!(!cloudbet.enabled);
        let (url, league) = cloudbet.feeds[0].resolve(cloudbet.api_base.as_deref()).unwrap();
        assert_eq!(
            url,
            "https://cloudbet.example/pub/v2/odds/competitions/soccer-england-premier-league?markets=soccer.matchOdds"
        );
        assert_eq!(league, "league");
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        let err = toml::from_str::<AppConfig>("[http]\ntimeout = \"ten seconds\"").unwrap_err();
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_attempts() {
        let mut cfg: AppConfig = toml::from_str(
            "[[sources]]\nkey = \"a\"\n[[sources]]\nkey = \"a\"\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
        cfg.sources.pop();
        assert!(cfg.validate().is_ok());
        cfg.http.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_backoff() {
        let cfg: AppConfig =
            toml::from_str("[scheduler.backoff]\ninitial = \"0s\"\nmax = \"0s\"\n").unwrap();
        assert!(matches!(cfg.validate(), Err(LinewatchError::Config(_))));

        let cfg: AppConfig = toml::from_str("[scheduler.backoff]\ninitial = \"30s\"\nmax = \"0s\"\n").unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig = toml::from_str("[scheduler.backoff]\ninitial = \"5m\"\nmax = \"1m\"\n").unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig = toml::from_str("[scheduler.backoff]\ninitial = \"1m\"\nmax = \"1m\"\n").unwrap();
        assert!(cfg.validate().is_ok());

        let cfg: AppConfig = toml::from_str("[[sources]]\nkey = \"a\"\ncadence = \"0s\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_edge_threshold_check() {
        assert!(check_edge_threshold(0.0).is_ok());
        assert!(check_edge_threshold(0.02).is_ok());
        assert!(check_edge_threshold(f64::NAN).is_err());
        assert!(check_edge_threshold(f64::INFINITY).is_err());
        assert!(check_edge_threshold(-0.05).is_err());

        let mut cfg = AppConfig::default();
        cfg.consensus.edge_threshold = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_feed_resolution_errors() {
        let feed = FeedConfig {
            sport: "soccer".into(),
            ..Default::default()
        };
        assert!(feed.resolve(None).is_err());

        let feed = FeedConfig {
            competition_key: Some("soccer-x".into()),
            ..Default::default()
        };
        assert!(feed.resolve(None).is_err());
        assert!(feed.resolve(Some("https://api")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LINEWATCH_DB_PATH", "/data/lw.db"),
            ("LINEWATCH_EDGE_THRESHOLD", "0.03"),
        ]
        .into_iter()
        .collect();
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.store.path, "/data/lw.db");
        assert!((cfg.consensus.edge_threshold - 0.03).abs() < 1e-12);

        let mut cfg = AppConfig::default();
        let bad = cfg.apply_overrides(|k| (k == "LINEWATCH_QUOTES_TTL_DAYS").then(|| "two".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_settings_roundtrip_through_toml() {
        let cfg = AppConfig::default();
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        assert!(rendered.contains("default_cadence = \"10m\""));
        let back: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.scheduler.default_cadence, cfg.scheduler.default_cadence);
    }

    #[test]
    fn test_shipped_config_parses() {
        let cfg: AppConfig = toml::from_str(include_str!("../linewatch.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.sources.len(), 2);
        let bovada = cfg.source("bovada").unwrap();
        assert!(bovada.no_cache);
        assert_eq!(bovada.market_map[&MarketKind::Moneyline], vec!["moneyline".to_string()]);
        let cloudbet = cfg.source("cloudbet").unwrap();
        let (url, league) = cloudbet.feeds[1].resolve(cloudbet.api_base.as_deref()).unwrap();
        assert!(url.ends_with("/competitions/tennis-atp-atp-tour?markets=tennis.winner"));
        assert_eq!(league, "tour");
    }

    #[test]
    fn test_missing_api_key_env_is_config_error() {
        let src = SourceConfig {
            key: "cloudbet".into(),
            enabled: true,
            cadence: None,
            mapper: None,
            no_cache: false,
            timeout: None,
            api_key_env: Some("LINEWATCH_TEST_UNSET_KEY_7F3A".into()),
            api_base: None,
            market_map: BTreeMap::new(),
            feeds: Vec::new(),
        };
        assert!(matches!(src.api_key(), Err(LinewatchError::Config(_))));
    }
}
