use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::payments::DEFAULT_PLATFORM_FEE_BPS;
use crate::selector::DEFAULT_CPC_ESTIMATED_CTR_BPS;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    pub platform_fee_bps: u32,
    pub funding_sweep_enabled: bool,
    pub funding_sweep_interval_seconds: u64,
    pub cpc_estimated_ctr_bps: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RUNTIME_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid RUNTIME_PLATFORM_FEE_BPS: {0}")]
    InvalidPlatformFeeBps(String),
    #[error("invalid RUNTIME_FUNDING_SWEEP_ENABLED: {0}")]
    InvalidFundingSweepEnabled(String),
    #[error("invalid RUNTIME_FUNDING_SWEEP_INTERVAL_SECONDS: {0}")]
    InvalidFundingSweepIntervalSeconds(String),
    #[error("invalid RUNTIME_CPC_ESTIMATED_CTR_BPS: {0}")]
    InvalidCpcEstimatedCtrBps(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = value_or("RUNTIME_BIND_ADDR", "127.0.0.1:4100").parse()?;
        let service_name = value_or("RUNTIME_SERVICE_NAME", "admarket-runtime");
        let build_sha = value_or("RUNTIME_BUILD_SHA", "dev");
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let platform_fee_bps = value_or(
            "RUNTIME_PLATFORM_FEE_BPS",
            &DEFAULT_PLATFORM_FEE_BPS.to_string(),
        )
        .trim()
        .parse::<u32>()
        .map_err(|error| ConfigError::InvalidPlatformFeeBps(error.to_string()))?;
        if platform_fee_bps > 10_000 {
            return Err(ConfigError::InvalidPlatformFeeBps(format!(
                "{platform_fee_bps} exceeds 10000"
            )));
        }

        let funding_sweep_enabled = parse_bool(
            lookup("RUNTIME_FUNDING_SWEEP_ENABLED").as_deref(),
            true,
        )
        .map_err(ConfigError::InvalidFundingSweepEnabled)?;
        let funding_sweep_interval_seconds =
            value_or("RUNTIME_FUNDING_SWEEP_INTERVAL_SECONDS", "300")
                .trim()
                .parse::<u64>()
                .map_err(|error| {
                    ConfigError::InvalidFundingSweepIntervalSeconds(error.to_string())
                })?;
        if funding_sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidFundingSweepIntervalSeconds(
                "must be greater than zero".to_string(),
            ));
        }

        let cpc_estimated_ctr_bps = value_or(
            "RUNTIME_CPC_ESTIMATED_CTR_BPS",
            &DEFAULT_CPC_ESTIMATED_CTR_BPS.to_string(),
        )
        .trim()
        .parse::<u32>()
        .map_err(|error| ConfigError::InvalidCpcEstimatedCtrBps(error.to_string()))?
        .min(10_000);

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            platform_fee_bps,
            funding_sweep_enabled,
            funding_sweep_interval_seconds,
            cpc_estimated_ctr_bps,
        })
    }
}

fn parse_bool(raw: Option<&str>, default: bool) -> Result<bool, String> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::{Result, anyhow};

    use super::{Config, ConfigError};

    fn parse(values: &HashMap<&str, &str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() -> Result<()> {
        let config = parse(&HashMap::new())?;
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:4100");
        assert_eq!(config.service_name, "admarket-runtime");
        assert_eq!(config.build_sha, "dev");
        assert_eq!(config.db_url, None);
        assert_eq!(config.platform_fee_bps, 1_000);
        assert!(config.funding_sweep_enabled);
        assert_eq!(config.funding_sweep_interval_seconds, 300);
        assert_eq!(config.cpc_estimated_ctr_bps, 100);
        Ok(())
    }

    #[test]
    fn overrides_are_parsed() -> Result<()> {
        let values = HashMap::from([
            ("RUNTIME_BIND_ADDR", "0.0.0.0:8080"),
            ("DATABASE_URL", " postgres://localhost/ads "),
            ("RUNTIME_PLATFORM_FEE_BPS", "250"),
            ("RUNTIME_FUNDING_SWEEP_ENABLED", "off"),
            ("RUNTIME_FUNDING_SWEEP_INTERVAL_SECONDS", "15"),
            ("RUNTIME_CPC_ESTIMATED_CTR_BPS", "50000"),
        ]);
        let config = parse(&values)?;
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.db_url.as_deref(), Some("postgres://localhost/ads"));
        assert_eq!(config.platform_fee_bps, 250);
        assert!(!config.funding_sweep_enabled);
        assert_eq!(config.funding_sweep_interval_seconds, 15);
        assert_eq!(config.cpc_estimated_ctr_bps, 10_000);
        Ok(())
    }

    #[test]
    fn db_url_takes_precedence_and_blank_means_memory() -> Result<()> {
        let values = HashMap::from([
            ("DB_URL", "postgres://primary/ads"),
            ("DATABASE_URL", "postgres://fallback/ads"),
        ]);
        assert_eq!(
            parse(&values)?.db_url.as_deref(),
            Some("postgres://primary/ads")
        );
        let blank = HashMap::from([("DB_URL", "  ")]);
        assert_eq!(parse(&blank)?.db_url, None);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() -> Result<()> {
        let cases = [
            ("RUNTIME_BIND_ADDR", "nope"),
            ("RUNTIME_PLATFORM_FEE_BPS", "10001"),
            ("RUNTIME_PLATFORM_FEE_BPS", "-5"),
            ("RUNTIME_FUNDING_SWEEP_ENABLED", "maybe"),
            ("RUNTIME_FUNDING_SWEEP_INTERVAL_SECONDS", "0"),
            ("RUNTIME_CPC_ESTIMATED_CTR_BPS", "abc"),
        ];
        for (key, value) in cases {
            let values = HashMap::from([(key, value)]);
            match parse(&values) {
                Err(
                    ConfigError::BindAddrParse(_)
                    | ConfigError::InvalidPlatformFeeBps(_)
                    | ConfigError::InvalidFundingSweepEnabled(_)
                    | ConfigError::InvalidFundingSweepIntervalSeconds(_)
                    | ConfigError::InvalidCpcEstimatedCtrBps(_),
                ) => {}
                Ok(_) => return Err(anyhow!("{key}={value} should be rejected")),
            }
        }
        Ok(())
    }
}
