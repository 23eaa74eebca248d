// =============================================================================
// Config Store — MTF global config, per-symbol overrides, trailing stops
// =============================================================================
//
// The global MTF config is a single logical row; per-(symbol, user-broker)
// override rows carry nullable fields with inherit semantics, resolved by
// the pure merge in `MtfConfig::merged_with`. Resolution order is global →
// symbol-wide override → symbol-and-user-broker override.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::config::{MtfConfig, MtfOverride, TrailingStopsConfig};
use crate::store::Db;

#[derive(Clone)]
pub struct ConfigStore {
    db: Arc<Db>,
}

impl ConfigStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------------
    // MTF global
    // -------------------------------------------------------------------------

    /// Load the global config; defaults apply until one is stored.
    pub fn mtf_global(&self) -> Result<MtfConfig> {
        self.db.with(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT config_json FROM mtf_config_global WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(j) => serde_json::from_str(&j).context("failed to parse stored mtf config"),
                None => Ok(MtfConfig::default()),
            }
        })
    }

    pub fn set_mtf_global(&self, config: &MtfConfig, now: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(config).context("failed to serialise mtf config")?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO mtf_config_global (id, config_json, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET
                    config_json = excluded.config_json,
                    updated_at = excluded.updated_at",
                params![json, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Per-symbol overrides
    // -------------------------------------------------------------------------

    /// An absent user-broker id addresses the symbol-wide override row,
    /// stored under the empty-string key.
    pub fn symbol_override(
        &self,
        symbol: &str,
        user_broker_id: Option<Uuid>,
    ) -> Result<Option<MtfOverride>> {
        let ub_key = user_broker_id.map(|u| u.to_string()).unwrap_or_default();
        self.db.with(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT override_json FROM mtf_config_symbol
                     WHERE symbol = ?1 AND user_broker_id = ?2",
                    params![symbol, ub_key],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).context("failed to parse symbol override"))
                .transpose()
        })
    }

    pub fn set_symbol_override(
        &self,
        symbol: &str,
        user_broker_id: Option<Uuid>,
        ov: &MtfOverride,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let json = serde_json::to_string(ov).context("failed to serialise symbol override")?;
        let ub_key = user_broker_id.map(|u| u.to_string()).unwrap_or_default();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO mtf_config_symbol (symbol, user_broker_id, override_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (symbol, user_broker_id) DO UPDATE SET
                    override_json = excluded.override_json,
                    updated_at = excluded.updated_at",
                params![symbol, ub_key, json, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Effective config for (symbol, user-broker): global, then the
    /// symbol-wide override, then the user-broker-specific override.
    pub fn resolve(&self, symbol: &str, user_broker_id: Option<Uuid>) -> Result<MtfConfig> {
        let mut cfg = self.mtf_global()?;
        if let Some(ov) = self.symbol_override(symbol, None)? {
            cfg = cfg.merged_with(&ov);
        }
        if user_broker_id.is_some() {
            if let Some(ov) = self.symbol_override(symbol, user_broker_id)? {
                cfg = cfg.merged_with(&ov);
            }
        }
        Ok(cfg)
    }

    // -------------------------------------------------------------------------
    // Trailing stops
    // -------------------------------------------------------------------------

    pub fn trailing(&self) -> Result<TrailingStopsConfig> {
        self.db.with(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT config_json FROM trailing_config WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(j) => {
                    serde_json::from_str(&j).context("failed to parse trailing-stops config")
                }
                None => Ok(TrailingStopsConfig::default()),
            }
        })
    }

    pub fn set_trailing(&self, config: &TrailingStopsConfig, now: DateTime<Utc>) -> Result<()> {
        let json =
            serde_json::to_string(config).context("failed to serialise trailing-stops config")?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO trailing_config (id, config_json, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET
                    config_json = excluded.config_json,
                    updated_at = excluded.updated_at",
                params![json, now.to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::new(Arc::new(Db::open_in_memory().unwrap()))
    }

    #[test]
    fn global_defaults_until_stored() {
        let store = store();
        let cfg = store.mtf_global().unwrap();
        assert_eq!(cfg, MtfConfig::default());

        let mut custom = MtfConfig::default();
        custom.entry_offset_pct = 0.2;
        store.set_mtf_global(&custom, Utc::now()).unwrap();
        assert_eq!(store.mtf_global().unwrap(), custom);
    }

    #[test]
    fn resolution_layers_overrides() {
        let store = store();
        let ub = Uuid::new_v4();

        let symbol_wide = MtfOverride {
            entry_offset_pct: Some(0.3),
            target_r: Some(3.0),
            ..MtfOverride::default()
        };
        store
            .set_symbol_override("RELIANCE", None, &symbol_wide, Utc::now())
            .unwrap();

        let per_ub = MtfOverride {
            target_r: Some(4.0),
            ..MtfOverride::default()
        };
        store
            .set_symbol_override("RELIANCE", Some(ub), &per_ub, Utc::now())
            .unwrap();

        let resolved = store.resolve("RELIANCE", Some(ub)).unwrap();
        // Symbol-wide override survives where the per-ub row is null.
        assert!((resolved.entry_offset_pct - 0.3).abs() < f64::EPSILON);
        // Per-ub override wins where set.
        assert!((resolved.target_r - 4.0).abs() < f64::EPSILON);
        // Everything else inherits the global default.
        assert_eq!(resolved.ltf_depth, MtfConfig::default().ltf_depth);

        // Unrelated symbols resolve to the plain global config.
        let other = store.resolve("TCS", Some(ub)).unwrap();
        assert_eq!(other, MtfConfig::default());
    }

    #[test]
    fn override_upsert_replaces() {
        let store = store();
        let first = MtfOverride {
            allow_rebuy: Some(true),
            ..MtfOverride::default()
        };
        store
            .set_symbol_override("INFY", None, &first, Utc::now())
            .unwrap();
        let second = MtfOverride {
            allow_rebuy: Some(false),
            ..MtfOverride::default()
        };
        store
            .set_symbol_override("INFY", None, &second, Utc::now())
            .unwrap();

        let got = store.symbol_override("INFY", None).unwrap().unwrap();
        assert_eq!(got.allow_rebuy, Some(false));
    }

    #[test]
    fn trailing_roundtrip() {
        let store = store();
        assert_eq!(store.trailing().unwrap(), TrailingStopsConfig::default());

        let mut cfg = TrailingStopsConfig::default();
        cfg.trailing_percent = 0.75;
        store.set_trailing(&cfg, Utc::now()).unwrap();
        assert_eq!(store.trailing().unwrap(), cfg);
    }
}
