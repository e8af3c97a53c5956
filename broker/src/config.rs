use std::{env, net::SocketAddr, path::PathBuf, str::FromStr};

use crate::error::ConfigError;

/// Configuración del broker. Se lee una sola vez al arrancar y se pasa a
/// quien la necesite; no hay estado global.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// Modo local: una sola cola compartida, sin lanzar máquinas.
    pub offline: bool,
    pub max_workers: usize,
    pub results_dir: PathBuf,
    pub results_bucket: String,
    pub scratch_dir: PathBuf,
    pub launch_concurrency: usize,
    pub launch: LaunchSettings,
}

/// Lo que necesita un worker nuevo para arrancar y encontrar al broker.
#[derive(Debug, Clone, Default)]
pub struct LaunchSettings {
    pub public_addr: String,
    pub broker_port: u16,
    pub worker_port: u16,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub iam_role: String,
    pub log_group: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], 7070));
        Self {
            bind_addr,
            offline: true,
            max_workers: 250,
            results_dir: PathBuf::from("/tmp/broker/results"),
            results_bucket: "analysis-results".to_string(),
            scratch_dir: env::temp_dir().join("broker"),
            launch_concurrency: 4,
            launch: LaunchSettings {
                public_addr: "localhost".to_string(),
                broker_port: bind_addr.port(),
                worker_port: 7080,
                instance_type: "c5.2xlarge".to_string(),
                ..LaunchSettings::default()
            },
        }
    }
}

impl BrokerConfig {
    /// Lee las variables de entorno `BROKER_*` y `WORKER_*`.
    /// Lo que no esté definido queda con su valor por defecto.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bind_addr: SocketAddr = parse_or(&lookup, "BROKER_BIND_ADDR", defaults.bind_addr)?;
        let offline = parse_bool_or(&lookup, "BROKER_OFFLINE", defaults.offline)?;
        let max_workers = parse_or(&lookup, "BROKER_MAX_WORKERS", defaults.max_workers)?;
        let launch_concurrency =
            parse_or(&lookup, "BROKER_LAUNCH_CONCURRENCY", defaults.launch_concurrency)?;
        if launch_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "BROKER_LAUNCH_CONCURRENCY".to_string(),
                value: "0".to_string(),
            });
        }

        let string_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            bind_addr,
            offline,
            max_workers,
            results_dir: lookup("BROKER_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            results_bucket: string_or("BROKER_RESULTS_BUCKET", &defaults.results_bucket),
            scratch_dir: lookup("BROKER_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            launch_concurrency,
            launch: LaunchSettings {
                public_addr: string_or("BROKER_PUBLIC_ADDR", &defaults.launch.public_addr),
                broker_port: bind_addr.port(),
                worker_port: parse_or(&lookup, "WORKER_PORT", defaults.launch.worker_port)?,
                image_id: string_or("WORKER_IMAGE_ID", ""),
                instance_type: string_or("WORKER_INSTANCE_TYPE", &defaults.launch.instance_type),
                subnet_id: string_or("WORKER_SUBNET_ID", ""),
                iam_role: string_or("WORKER_IAM_ROLE", ""),
                log_group: string_or("WORKER_LOG_GROUP", ""),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn sin_variables_usa_los_defaults() {
        let cfg = BrokerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert!(cfg.offline);
        assert_eq!(cfg.max_workers, 250);
        assert_eq!(cfg.bind_addr.port(), 7070);
        assert_eq!(cfg.launch.worker_port, 7080);
    }

    #[test]
    fn lee_valores_del_entorno() {
        let cfg = BrokerConfig::from_lookup(lookup_from(&[
            ("BROKER_OFFLINE", "false"),
            ("BROKER_MAX_WORKERS", "12"),
            ("BROKER_BIND_ADDR", "127.0.0.1:9000"),
            ("WORKER_IMAGE_ID", "ami-123"),
        ]))
        .unwrap();
        assert!(!cfg.offline);
        assert_eq!(cfg.max_workers, 12);
        assert_eq!(cfg.launch.broker_port, 9000);
        assert_eq!(cfg.launch.image_id, "ami-123");
    }

    #[test]
    fn valores_invalidos_son_error() {
        let err = BrokerConfig::from_lookup(lookup_from(&[("BROKER_MAX_WORKERS", "muchos")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "BROKER_MAX_WORKERS"));

        assert!(BrokerConfig::from_lookup(lookup_from(&[("BROKER_OFFLINE", "quizas")])).is_err());
        assert!(BrokerConfig::from_lookup(lookup_from(&[("BROKER_LAUNCH_CONCURRENCY", "0")])).is_err());
    }
}
