use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use sluice_core::ItemKind;
use sluice_node::{AbuseConfig, FetcherConfig, KindCost};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct BenchConfig {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub peers: usize,
    pub items_per_delivery: usize,
    /// BLAKE3 rounds the synthetic sink spends per item.
    pub validation_rounds: u32,
    pub invalid_percent: u8,
    pub item_kind: u8,
    pub item_size: usize,
    /// Distinct items cycled through by the flooders; 0 sizes it from the
    /// peer count.
    pub corpus_size: usize,
    /// Stop a flooder once the fetcher asks for its disconnect.
    pub honor_disconnects: bool,
    pub report_path: Option<PathBuf>,
    pub add_batch_size: usize,
    pub max_validation_workers: usize,
    pub cooldown_fraction: f64,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    pub sustained_reject_threshold: f64,
    pub sustained_batches: usize,
    /// Validation cost weight of `item_kind` relative to other kinds.
    pub item_cost: f64,
}

fn default_peers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

impl BenchConfig {
    /// Loads defaults, then the optional file, then `SLUICE_BENCH_*` variables.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let fetcher = FetcherConfig::default();
        let mut builder = Config::builder()
            .set_default("duration", "10s")?
            .set_default("peers", default_peers() as u64)?
            .set_default("items_per_delivery", 32)?
            .set_default("validation_rounds", 2048)?
            .set_default("invalid_percent", 100)?
            .set_default("item_kind", 3)?
            .set_default("item_size", 131_072)?
            .set_default("corpus_size", 0)?
            .set_default("honor_disconnects", true)?
            .set_default("report_path", None::<String>)?
            .set_default("add_batch_size", fetcher.add_batch_size as u64)?
            .set_default(
                "max_validation_workers",
                fetcher.max_validation_workers as u64,
            )?
            .set_default("cooldown_fraction", fetcher.abuse.cooldown_fraction)?
            .set_default("cooldown", "200ms")?
            .set_default(
                "sustained_reject_threshold",
                fetcher.abuse.sustained_reject_threshold,
            )?
            .set_default("sustained_batches", fetcher.abuse.sustained_batches as u64)?
            .set_default("item_cost", 1.0)?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the prefixed source
                // below picks the values up.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("SLUICE_BENCH").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Corpus size actually used by the flood.
    pub fn effective_corpus_size(&self) -> usize {
        if self.corpus_size > 0 {
            return self.corpus_size;
        }
        (self.peers * self.items_per_delivery * 2).max(1024)
    }

    /// Fetcher settings for the flood run.
    pub fn fetcher_config(&self) -> FetcherConfig {
        let mut kind_costs = Vec::new();
        if (self.item_cost - 1.0).abs() > f64::EPSILON {
            kind_costs.push(KindCost {
                kind: ItemKind(self.item_kind),
                cost: self.item_cost,
            });
        }
        FetcherConfig {
            add_batch_size: self.add_batch_size,
            max_validation_workers: self.max_validation_workers,
            abuse: AbuseConfig {
                cooldown_fraction: self.cooldown_fraction,
                cooldown: self.cooldown,
                sustained_reject_threshold: self.sustained_reject_threshold,
                sustained_batches: self.sustained_batches,
                kind_costs,
            },
            ..FetcherConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    // Tests below mutate the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = BenchConfig::new(None).expect("failed to build config");

            assert_eq!(cfg.duration, Duration::from_secs(10));
            assert!(cfg.peers >= 1);
            assert_eq!(cfg.items_per_delivery, 32);
            assert_eq!(cfg.validation_rounds, 2048);
            assert_eq!(cfg.invalid_percent, 100);
            assert_eq!(cfg.item_kind, 3);
            assert!(cfg.honor_disconnects);
            assert_eq!(cfg.report_path, None);
            assert_eq!(cfg.cooldown, Duration::from_millis(200));
            assert_eq!(cfg.sustained_batches, 8);
            assert!((cfg.cooldown_fraction - 0.25).abs() < f64::EPSILON);
            assert!(cfg.fetcher_config().validate().is_ok());
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("SLUICE_BENCH_PEERS", "7"),
                ("SLUICE_BENCH_HONOR_DISCONNECTS", "false"),
                ("SLUICE_BENCH_SUSTAINED_REJECT_THRESHOLD", "0.05"),
                ("SLUICE_BENCH_DURATION", "1m30s"),
                ("SLUICE_BENCH_COOLDOWN", "5ms"),
            ],
            || {
                let cfg = BenchConfig::new(None).expect("failed to build config");
                assert_eq!(cfg.peers, 7);
                assert!(!cfg.honor_disconnects);
                assert!((cfg.sustained_reject_threshold - 0.05).abs() < f64::EPSILON);
                assert_eq!(cfg.duration, Duration::from_secs(90));
                assert_eq!(cfg.cooldown, Duration::from_millis(5));
            },
        );
    }

    #[test]
    fn env_beats_file_and_file_beats_defaults() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
items_per_delivery = 8
validation_rounds = 16
duration = "2s"
report_path = "out/report.json"
"#
        )
        .expect("write to temp file");

        with_env(&[("SLUICE_BENCH_VALIDATION_ROUNDS", "99")], || {
            let cfg = BenchConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.items_per_delivery, 8);
            assert_eq!(cfg.validation_rounds, 99);
            assert_eq!(cfg.duration, Duration::from_secs(2));
            assert_eq!(cfg.report_path, Some(PathBuf::from("out/report.json")));
        });
    }

    #[test]
    fn fetcher_config_carries_abuse_knobs() {
        with_env(&[("SLUICE_BENCH_ITEM_COST", "16")], || {
            let cfg = BenchConfig::new(None).expect("failed to build config");
            let fetcher = cfg.fetcher_config();
            assert_eq!(fetcher.add_batch_size, cfg.add_batch_size);
            assert_eq!(fetcher.abuse.cooldown, cfg.cooldown);
            assert_eq!(fetcher.abuse.cost_of(ItemKind(cfg.item_kind)), 16.0);
            assert_eq!(fetcher.abuse.cost_of(ItemKind(0)), 1.0);
        });
    }

    #[test]
    fn corpus_is_sized_from_peers_when_unset() {
        with_env(&[], || {
            let mut cfg = BenchConfig::new(None).expect("failed to build config");
            cfg.peers = 100;
            cfg.items_per_delivery = 32;
            assert_eq!(cfg.effective_corpus_size(), 6_400);
            cfg.peers = 1;
            assert_eq!(cfg.effective_corpus_size(), 1024);
            cfg.corpus_size = 10;
            assert_eq!(cfg.effective_corpus_size(), 10);
        });
    }
}
