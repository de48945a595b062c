use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsa110_contracts::error::Result;
use dsa110_contracts::external::TransitTimeCalculator;
use dsa110_contracts::repository::CalibratorRegistryPort;
use dsa110_model::{CalibratorBlacklistEntry, CalibratorRegistration, CalibratorSource, RegistrationStatus};
use std::str::FromStr;
use sqlx::{Row, SqlitePool};

/// Calibrator registry repository (spec §4.C).
#[derive(Clone)]
pub struct CalibratorRegistryRepository {
    pool: SqlitePool,
}

impl CalibratorRegistryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CalibratorRegistryPort for CalibratorRegistryRepository {
    async fn register(&self, registration: &CalibratorRegistration) -> Result<()> {
        let source = &registration.source;
        sqlx::query(
            r#"
            INSERT INTO calibrator_registrations
                (calibrator_name, observation_date, ra_deg, dec_deg, flux_jy,
                 spectral_index, compactness, catalog, quality_score,
                 transit_time, dec_range_min, dec_range_max, status,
                 registered_by, notes, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(calibrator_name, observation_date) DO UPDATE SET
                ra_deg = excluded.ra_deg,
                dec_deg = excluded.dec_deg,
                flux_jy = excluded.flux_jy,
                spectral_index = excluded.spectral_index,
                compactness = excluded.compactness,
                catalog = excluded.catalog,
                quality_score = excluded.quality_score,
                transit_time = excluded.transit_time,
                dec_range_min = excluded.dec_range_min,
                dec_range_max = excluded.dec_range_max,
                status = excluded.status,
                registered_by = excluded.registered_by,
                notes = excluded.notes,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(&source.name)
        .bind(&registration.observation_date)
        .bind(source.ra_deg)
        .bind(source.dec_deg)
        .bind(source.flux_jy)
        .bind(source.spectral_index)
        .bind(source.compactness)
        .bind(&source.catalog)
        .bind(registration.quality_score)
        .bind(registration.transit_time.to_rfc3339())
        .bind(registration.dec_range_min)
        .bind(registration.dec_range_max)
        .bind(registration.status.as_str())
        .bind(&registration.registered_by)
        .bind(&registration.notes)
        .bind(registration.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_for_date(
        &self,
        observation_date: &str,
    ) -> Result<Option<CalibratorRegistration>> {
        let row = sqlx::query(
            r#"SELECT calibrator_name, observation_date, ra_deg, dec_deg, flux_jy,
                      spectral_index, compactness, catalog, quality_score,
                      transit_time, dec_range_min, dec_range_max, status,
                      registered_by, notes, registered_at
               FROM calibrator_registrations WHERE observation_date = ?1"#,
        )
        .bind(observation_date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let transit_time: String = r.get("transit_time");
            let registered_at: String = r.get("registered_at");
            let status: String = r.get("status");
            CalibratorRegistration {
                source: CalibratorSource {
                    name: r.get("calibrator_name"),
                    ra_deg: r.get("ra_deg"),
                    dec_deg: r.get("dec_deg"),
                    flux_jy: r.get("flux_jy"),
                    spectral_index: r.get("spectral_index"),
                    compactness: r.get("compactness"),
                    catalog: r.get("catalog"),
                },
                observation_date: r.get("observation_date"),
                transit_time: parse_rfc3339(&transit_time),
                quality_score: r.get("quality_score"),
                dec_range_min: r.get("dec_range_min"),
                dec_range_max: r.get("dec_range_max"),
                status: RegistrationStatus::from_str(&status).unwrap_or(RegistrationStatus::Active),
                registered_by: r.get("registered_by"),
                notes: r.get("notes"),
                registered_at: parse_rfc3339(&registered_at),
            }
        }))
    }

    async fn blacklist(&self, entry: &CalibratorBlacklistEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO calibrator_blacklist (name, ra_deg, dec_deg, radius_deg, reason, blacklisted_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(&entry.name)
        .bind(entry.ra_deg)
        .bind(entry.dec_deg)
        .bind(entry.radius_deg)
        .bind(&entry.reason)
        .bind(entry.blacklisted_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn blacklist_entries(&self) -> Result<Vec<CalibratorBlacklistEntry>> {
        let rows = sqlx::query(
            "SELECT name, ra_deg, dec_deg, radius_deg, reason, blacklisted_at FROM calibrator_blacklist",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let blacklisted_at: String = r.get("blacklisted_at");
                CalibratorBlacklistEntry {
                    name: r.get("name"),
                    ra_deg: r.get("ra_deg"),
                    dec_deg: r.get("dec_deg"),
                    radius_deg: r.get("radius_deg"),
                    reason: r.get("reason"),
                    blacklisted_at: parse_rfc3339(&blacklisted_at),
                }
            })
            .collect())
    }

    async fn transit_time(
        &self,
        calibrator_name: &str,
        date: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT transit_time FROM calibrator_registrations WHERE calibrator_name = ?1 AND observation_date = ?2",
        )
        .bind(calibrator_name)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| parse_rfc3339(&r.get::<String, _>("transit_time"))))
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Default declination-change threshold that triggers calibrator
/// re-acquisition (spec §4.C).
pub const DEFAULT_DECLINATION_CHANGE_THRESHOLD_DEG: f64 = 0.1;

/// Default declination tolerance when matching a registered/catalog
/// calibrator to a new pointing (spec §4.C: "`d_new ± 2.5°`").
pub const DECLINATION_MATCH_TOLERANCE_DEG: f64 = 2.5;

/// Whether a shard's new pointing declination should trigger calibrator
/// re-acquisition, comparing against the most recent declination seen.
pub fn declination_change_triggers(
    d_old: f64,
    d_new: f64,
    threshold_deg: f64,
) -> bool {
    (d_new - d_old).abs() > threshold_deg
}

/// Candidate source considered during auto-acquisition, tagged with which
/// tier of the fallback chain it came from (spec §4.C step 1-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcquisitionTier {
    Registered,
    Catalog,
    NvssFallback,
}

/// Filter out blacklisted sources: by exact name, then by coordinate cone
/// (spec §4.C: "checked by name first and then by coordinate cone").
pub fn filter_blacklisted<'a>(
    sources: impl IntoIterator<Item = &'a CalibratorSource>,
    blacklist: &[CalibratorBlacklistEntry],
) -> Vec<&'a CalibratorSource> {
    sources
        .into_iter()
        .filter(|source| !blacklist.iter().any(|entry| entry.excludes(source)))
        .collect()
}

/// Pick the best candidate within tolerance of `d_new`: a registered
/// calibrator first (matched by declination-range coverage, not point
/// distance), else the highest-quality catalog source, else the NVSS
/// fallback brightest entry (spec §4.C decision procedure).
pub fn select_best_candidate<'a>(
    d_new: f64,
    registered: &'a [CalibratorRegistration],
    catalog: &'a [CalibratorSource],
    nvss_fallback: &'a [CalibratorSource],
    blacklist: &[CalibratorBlacklistEntry],
) -> Option<(&'a CalibratorSource, AcquisitionTier)> {
    let within_tolerance = |s: &&CalibratorSource| {
        (s.dec_deg - d_new).abs() <= DECLINATION_MATCH_TOLERANCE_DEG
    };

    let registered_candidates: Vec<&CalibratorRegistration> = registered
        .iter()
        .filter(|r| r.status == RegistrationStatus::Active)
        .filter(|r| !blacklist.iter().any(|entry| entry.excludes(&r.source)))
        .collect();
    if let Some(best) = registered_candidates
        .into_iter()
        .filter(|r| r.covers_declination(d_new))
        .max_by(|a, b| a.quality_score.partial_cmp(&b.quality_score).unwrap())
    {
        return Some((&best.source, AcquisitionTier::Registered));
    }

    let catalog_candidates = filter_blacklisted(catalog, blacklist);
    if let Some(best) = catalog_candidates
        .into_iter()
        .filter(within_tolerance)
        .max_by(|a, b| a.quality_score().partial_cmp(&b.quality_score()).unwrap())
    {
        return Some((best, AcquisitionTier::Catalog));
    }

    let nvss_candidates = filter_blacklisted(nvss_fallback, blacklist);
    if let Some(brightest) = nvss_candidates
        .into_iter()
        .filter(within_tolerance)
        .max_by(|a, b| a.flux_jy.partial_cmp(&b.flux_jy).unwrap())
    {
        return Some((brightest, AcquisitionTier::NvssFallback));
    }

    None
}

/// Default [`TransitTimeCalculator`] that always returns the observation
/// midnight as a placeholder; the actual sidereal-time computation is an
/// external collaborator (spec §4.C, Non-goals).
#[derive(Debug, Default)]
pub struct PlaceholderTransitCalculator;

impl TransitTimeCalculator for PlaceholderTransitCalculator {
    fn transit_time(&self, _ra_deg: f64, observation_date: &str) -> DateTime<Utc> {
        chrono::NaiveDate::parse_from_str(observation_date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, dec: f64, flux: f64) -> CalibratorSource {
        CalibratorSource {
            name: name.to_string(),
            ra_deg: 180.0,
            dec_deg: dec,
            flux_jy: flux,
            spectral_index: Some(0.0),
            compactness: Some(0.8),
            catalog: "test".to_string(),
        }
    }

    fn registration(name: &str, dec: f64, flux: f64, dec_range: (f64, f64)) -> CalibratorRegistration {
        CalibratorRegistration {
            source: source(name, dec, flux),
            observation_date: "2026-01-01".to_string(),
            transit_time: Utc::now(),
            quality_score: source(name, dec, flux).quality_score(),
            dec_range_min: dec_range.0,
            dec_range_max: dec_range.1,
            status: RegistrationStatus::Active,
            registered_by: "test".to_string(),
            notes: None,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn declination_change_respects_threshold() {
        assert!(!declination_change_triggers(10.0, 10.05, 0.1));
        assert!(declination_change_triggers(10.0, 10.2, 0.1));
    }

    #[test]
    fn registered_tier_wins_over_catalog() {
        let registered = vec![registration("reg", 20.0, 1.0, (17.5, 22.5))];
        let catalog = vec![source("cat", 20.0, 100.0)];
        let (best, tier) =
            select_best_candidate(20.0, &registered, &catalog, &[], &[]).unwrap();
        assert_eq!(best.name, "reg");
        assert_eq!(tier, AcquisitionTier::Registered);
    }

    #[test]
    fn registered_tier_requires_declination_range_coverage() {
        // Registered entry exists but its declination strip doesn't reach
        // d_new, so the catalog tier should win instead.
        let registered = vec![registration("reg", 20.0, 1.0, (18.0, 19.0))];
        let catalog = vec![source("cat", 20.0, 100.0)];
        let (best, tier) =
            select_best_candidate(20.0, &registered, &catalog, &[], &[]).unwrap();
        assert_eq!(best.name, "cat");
        assert_eq!(tier, AcquisitionTier::Catalog);
    }

    #[test]
    fn falls_back_to_nvss_when_nothing_else_in_tolerance() {
        let registered = vec![registration("reg", 80.0, 1.0, (77.5, 82.5))];
        let nvss = vec![source("nvss-dim", 20.0, 1.0), source("nvss-bright", 20.1, 5.0)];
        let (best, tier) =
            select_best_candidate(20.0, &registered, &[], &nvss, &[]).unwrap();
        assert_eq!(best.name, "nvss-bright");
        assert_eq!(tier, AcquisitionTier::NvssFallback);
    }

    #[test]
    fn blacklisted_name_is_excluded() {
        let registered = vec![registration("bad-cal", 20.0, 10.0, (17.5, 22.5))];
        let blacklist = vec![CalibratorBlacklistEntry {
            name: Some("bad-cal".to_string()),
            ra_deg: None,
            dec_deg: None,
            radius_deg: 0.01,
            reason: "known pulsar".to_string(),
            blacklisted_at: Utc::now(),
        }];
        assert!(select_best_candidate(20.0, &registered, &[], &[], &blacklist).is_none());
    }

    #[test]
    fn out_of_tolerance_candidates_are_rejected() {
        let registered = vec![registration("far", 30.0, 10.0, (27.5, 32.5))];
        assert!(select_best_candidate(20.0, &registered, &[], &[], &[]).is_none());
    }
}
