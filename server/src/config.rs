use time::Duration;

const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Process wide settings, read once at startup and handed to [`crate::app::AppState::new`].
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub unit_rate: f64,
    pub cors_origins: Vec<String>,
    pub environment: Environment,
    pub admin: Option<AdminSeed>,
}

const DEFAULT_CORS_ORIGINS: &[&str] = &["http://localhost:5173", "https://wstapp.netlify.app"];

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|it| !it.trim().is_empty());

        let port = match get("PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "PORT", value })?,
            None => 8001,
        };

        let mongo_uri = get("MONGO_URI").ok_or(ConfigError::Missing("MONGO_URI"))?;
        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let database_name = get("DB_NAME").unwrap_or_else(|| "wstapp".to_string());

        let token_ttl = match get("TOKEN_TTL_HOURS") {
            Some(value) => match value.trim().parse::<i64>() {
                Ok(hours) if (1..=MAX_TOKEN_TTL_HOURS).contains(&hours) => Duration::hours(hours),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "TOKEN_TTL_HOURS",
                        value,
                    })
                }
            },
            None => Duration::hours(48),
        };

        let unit_rate = match get("PICKUP_UNIT_RATE") {
            Some(value) => match value.trim().parse::<f64>() {
                Ok(rate) if rate.is_finite() && rate > 0.0 => rate,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "PICKUP_UNIT_RATE",
                        value,
                    })
                }
            },
            None => 10.0,
        };

        let cors_origins = match get("CORS_ORIGINS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|it| !it.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => DEFAULT_CORS_ORIGINS.iter().map(|it| it.to_string()).collect(),
        };

        let environment = match get("APP_ENV").as_deref().map(str::trim) {
            None | Some("production") => Environment::Production,
            Some("development") => Environment::Development,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "APP_ENV",
                    value: other.to_string(),
                })
            }
        };

        let admin = match (get("ADMIN_EMAIL"), get("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminSeed {
                name: get("ADMIN_NAME").unwrap_or_else(|| "Administrator".to_string()),
                email,
                password,
            }),
            _ => None,
        };

        Ok(Self {
            port,
            mongo_uri,
            database_name,
            jwt_secret,
            token_ttl,
            unit_rate,
            cors_origins,
            environment,
            admin,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("MONGO_URI", "mongodb://localhost:27017"),
            ("JWT_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8001);
        assert_eq!(config.database_name, "wstapp");
        assert_eq!(config.token_ttl, Duration::hours(48));
        assert_eq!(config.unit_rate, 10.0);
        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(config.environment, Environment::Production);
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("MONGO_URI", "mongodb://db:27017"),
            ("JWT_SECRET", "secret"),
            ("PORT", "9000"),
            ("DB_NAME", "pickups"),
            ("TOKEN_TTL_HOURS", "2"),
            ("PICKUP_UNIT_RATE", "12.5"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,"),
            ("APP_ENV", "development"),
            ("ADMIN_EMAIL", "admin@wstapp.test"),
            ("ADMIN_PASSWORD", "password"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.database_name, "pickups");
        assert_eq!(config.token_ttl, Duration::hours(2));
        assert_eq!(config.unit_rate, 12.5);
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert!(config.is_development());

        let admin = config.admin.expect("admin seed should be configured");
        assert_eq!(admin.email, "admin@wstapp.test");
        assert_eq!(admin.name, "Administrator");
    }

    #[test]
    fn test_missing_required() {
        let err = Config::from_lookup(lookup(&[("JWT_SECRET", "secret")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("MONGO_URI"));

        let err = Config::from_lookup(lookup(&[
            ("MONGO_URI", "mongodb://localhost"),
            ("JWT_SECRET", "  "),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("JWT_SECRET"));
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("PORT", "eighty"),
            ("PICKUP_UNIT_RATE", "-1"),
            ("PICKUP_UNIT_RATE", "NaN"),
            ("TOKEN_TTL_HOURS", "0"),
            ("TOKEN_TTL_HOURS", "8761"),
            ("TOKEN_TTL_HOURS", "9223372036854775807"),
            ("APP_ENV", "staging"),
        ] {
            let err = Config::from_lookup(lookup(&[
                ("MONGO_URI", "mongodb://localhost"),
                ("JWT_SECRET", "secret"),
                (key, value),
            ]))
            .unwrap_err();
            assert_matches!(err, ConfigError::Invalid { key: k, .. } if k == key);
        }
    }
}
