use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used by the HTTP access log layer.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

/// Where and how the rolling access log is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessLogSettings {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl AccessLogSettings {
    /// `None` unless `DECODE_ACCESS_LOG_ROLL=1`.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup("DECODE_ACCESS_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        let dir = lookup("DECODE_ACCESS_LOG_DIR")
            .or_else(|| lookup("DECODE_LOGS_DIR"))
            .unwrap_or_else(|| "logs".to_string());
        let prefix = lookup("DECODE_ACCESS_LOG_PREFIX").unwrap_or_else(|| "http-access".into());
        let rotation = match lookup("DECODE_ACCESS_LOG_ROTATION")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        };
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let access = AccessLogSettings::from_lookup(|key| std::env::var(key).ok());
    install_console(filter, access);
}

fn install_console(filter: EnvFilter, access: Option<AccessLogSettings>) {
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));
    let Some(access) = access else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&access.dir).is_err() {
        tracing::warn!(directory = %access.dir, "failed to create access log directory");
    }
    let writer = match access.rotation {
        Rotation::Hourly => tracing_appender::rolling::hourly(&access.dir, &access.prefix),
        Rotation::Minutely => tracing_appender::rolling::minutely(&access.dir, &access.prefix),
        Rotation::Daily => tracing_appender::rolling::daily(&access.dir, &access.prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = ACCESS_GUARD.set(guard);
    let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
    let access_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(access_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn access_log_disabled_by_default() {
        assert_eq!(AccessLogSettings::from_lookup(lookup(&[])), None);
        assert_eq!(
            AccessLogSettings::from_lookup(lookup(&[("DECODE_ACCESS_LOG_ROLL", "0")])),
            None
        );
    }

    #[test]
    fn access_log_settings_fall_back_to_logs_dir() {
        let settings = AccessLogSettings::from_lookup(lookup(&[
            ("DECODE_ACCESS_LOG_ROLL", "1"),
            ("DECODE_LOGS_DIR", "/var/log/decode"),
            ("DECODE_ACCESS_LOG_ROTATION", "Hourly"),
        ]))
        .expect("enabled");
        assert_eq!(settings.dir, "/var/log/decode");
        assert_eq!(settings.prefix, "http-access");
        assert_eq!(settings.rotation, Rotation::Hourly);
    }
}
