use std::collections::HashMap;

/// A detected or catalog source position, with an optional flux for
/// `flux_ratio` computation (spec §4.H cross-matching).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub flux_jy: Option<f64>,
}

/// One row of a cross-match join: a detected source paired with its
/// nearest catalog counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRow {
    pub idx_detected: usize,
    pub idx_catalog: usize,
    pub separation_arcsec: f64,
    pub dra_arcsec: f64,
    pub ddec_arcsec: f64,
    pub flux_ratio: Option<f64>,
}

/// Angular separation in arcsec between two positions, using the flat-sky
/// approximation (`cos(dec)` correction on RA) appropriate at the few-degree
/// scale these cross-matches operate at.
fn separation_arcsec(a: SkyPosition, b: SkyPosition) -> (f64, f64, f64) {
    let mean_dec_rad = ((a.dec_deg + b.dec_deg) / 2.0).to_radians();
    let dra_deg = (b.ra_deg - a.ra_deg) * mean_dec_rad.cos();
    let ddec_deg = b.dec_deg - a.dec_deg;
    let separation_deg = (dra_deg * dra_deg + ddec_deg * ddec_deg).sqrt();
    (dra_deg * 3600.0, ddec_deg * 3600.0, separation_deg * 3600.0)
}

/// Nearest-neighbor cross-match of `detected` against `catalog` within
/// `radius_arcsec` (spec §4.H: "build SkyCoords and produce the
/// nearest-neighbor join").
pub fn crossmatch(
    detected: &[SkyPosition],
    catalog: &[SkyPosition],
    radius_arcsec: f64,
) -> Vec<MatchRow> {
    let mut rows = Vec::new();
    for (idx_detected, det) in detected.iter().enumerate() {
        let mut best: Option<(usize, f64, f64, f64)> = None;
        for (idx_catalog, cat) in catalog.iter().enumerate() {
            let (dra, ddec, sep) = separation_arcsec(*det, *cat);
            if sep > radius_arcsec {
                continue;
            }
            if best.map(|(_, _, _, best_sep)| sep < best_sep).unwrap_or(true) {
                best = Some((idx_catalog, dra, ddec, sep));
            }
        }
        if let Some((idx_catalog, dra, ddec, sep)) = best {
            let flux_ratio = match (det.flux_jy, catalog[idx_catalog].flux_jy) {
                (Some(d), Some(c)) if c != 0.0 => Some(d / c),
                _ => None,
            };
            rows.push(MatchRow {
                idx_detected,
                idx_catalog,
                separation_arcsec: sep,
                dra_arcsec: dra,
                ddec_arcsec: ddec,
                flux_ratio,
            });
        }
    }
    rows
}

/// Result of matching one detected source against several reference
/// catalogs: the catalog name and match row with the smallest separation,
/// or `None` if no catalog had a match within radius (spec §4.H
/// multi-catalog match).
pub fn multi_catalog_match<'a>(
    detected: &[SkyPosition],
    catalogs: &[(&'a str, &[SkyPosition])],
    radius_arcsec: f64,
) -> Vec<Option<(&'a str, MatchRow)>> {
    (0..detected.len())
        .map(|idx_detected| {
            catalogs
                .iter()
                .filter_map(|(name, sources)| {
                    crossmatch(&detected[idx_detected..idx_detected + 1], sources, radius_arcsec)
                        .into_iter()
                        .next()
                        .map(|mut row| {
                            row.idx_detected = idx_detected;
                            (*name, row)
                        })
                })
                .min_by(|(_, a), (_, b)| {
                    a.separation_arcsec
                        .partial_cmp(&b.separation_arcsec)
                        .unwrap()
                })
        })
        .collect()
}

/// A catalog entry identified by `"<catalog>:<source_id>"`, used as the
/// union-find input for cross-catalog deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub catalog: String,
    pub source_id: String,
    pub position: SkyPosition,
}

/// Catalog priority for picking the master entry of a dedup group, highest
/// first (spec §4.H: "NVSS > FIRST > RACS").
fn catalog_priority(catalog: &str) -> u8 {
    match catalog {
        "nvss" | "NVSS" => 2,
        "first" | "FIRST" => 1,
        _ => 0,
    }
}

/// Deduplicate catalog entries within `radius_arcsec` of each other using a
/// union-find over all pairs, iterated to transitive closure, then mapping
/// every entry to its group's highest-priority member (spec §4.H
/// deduplication).
pub fn deduplicate_catalogs(
    entries: &[CatalogEntry],
    radius_arcsec: f64,
) -> HashMap<String, String> {
    let n = entries.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }

    fn union(parent: &mut [usize], a: usize, b: usize) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            parent[ra] = rb;
        }
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let (_, _, sep) = separation_arcsec(entries[i].position, entries[j].position);
            if sep <= radius_arcsec {
                union(&mut parent, i, j);
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(i);
    }

    let mut mapping = HashMap::new();
    for members in groups.values() {
        let master = members
            .iter()
            .max_by_key(|&&idx| catalog_priority(&entries[idx].catalog))
            .copied()
            .unwrap();
        let master_key = format!("{}:{}", entries[master].catalog, entries[master].source_id);
        for &idx in members {
            let key = format!("{}:{}", entries[idx].catalog, entries[idx].source_id);
            mapping.insert(key, master_key.clone());
        }
    }
    mapping
}

/// Median and median-absolute-deviation of a slice of `f64`.
fn median_and_mad(values: &mut [f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = values[values.len() / 2];
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mad = deviations[deviations.len() / 2];
    (median, mad)
}

/// Bulk positional/flux statistics from a set of match rows (spec §4.H
/// "positional and flux bulk statistics"): median RA/Dec offsets and their
/// MADs, plus a flux-scale correction (median of valid flux ratios).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchStatistics {
    pub median_dra_arcsec: f64,
    pub mad_dra_arcsec: f64,
    pub median_ddec_arcsec: f64,
    pub mad_ddec_arcsec: f64,
    pub flux_scale_correction: Option<f64>,
}

pub fn bulk_statistics(rows: &[MatchRow]) -> MatchStatistics {
    let mut dra: Vec<f64> = rows.iter().map(|r| r.dra_arcsec).collect();
    let mut ddec: Vec<f64> = rows.iter().map(|r| r.ddec_arcsec).collect();
    let (median_dra_arcsec, mad_dra_arcsec) = median_and_mad(&mut dra);
    let (median_ddec_arcsec, mad_ddec_arcsec) = median_and_mad(&mut ddec);

    let mut ratios: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.flux_ratio)
        .filter(|r| r.is_finite() && *r > 0.0)
        .collect();
    let flux_scale_correction = if ratios.is_empty() {
        None
    } else {
        Some(median_and_mad(&mut ratios).0)
    };

    MatchStatistics {
        median_dra_arcsec,
        mad_dra_arcsec,
        median_ddec_arcsec,
        mad_ddec_arcsec,
        flux_scale_correction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(ra: f64, dec: f64, flux: f64) -> SkyPosition {
        SkyPosition { ra_deg: ra, dec_deg: dec, flux_jy: Some(flux) }
    }

    #[test]
    fn crossmatch_finds_nearest_within_radius() {
        let detected = vec![pos(180.0, 20.0, 1.0)];
        let catalog = vec![pos(180.01, 20.0, 1.0), pos(180.0001, 20.0, 0.9)];
        let rows = crossmatch(&detected, &catalog, 5.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].idx_catalog, 1);
    }

    #[test]
    fn crossmatch_excludes_sources_outside_radius() {
        let detected = vec![pos(180.0, 20.0, 1.0)];
        let catalog = vec![pos(181.0, 20.0, 1.0)];
        assert!(crossmatch(&detected, &catalog, 1.0).is_empty());
    }

    #[test]
    fn dedup_groups_nearby_multi_catalog_entries_and_prefers_nvss() {
        let entries = vec![
            CatalogEntry { catalog: "nvss".to_string(), source_id: "1".to_string(), position: pos(180.0, 20.0, 1.0) },
            CatalogEntry { catalog: "first".to_string(), source_id: "9".to_string(), position: pos(180.00001, 20.0, 1.0) },
            CatalogEntry { catalog: "racs".to_string(), source_id: "3".to_string(), position: pos(190.0, 20.0, 1.0) },
        ];
        let mapping = deduplicate_catalogs(&entries, 2.0);
        assert_eq!(mapping["first:9"], "nvss:1");
        assert_eq!(mapping["racs:3"], "racs:3");
    }

    #[test]
    fn bulk_statistics_computes_median_offsets() {
        let rows = vec![
            MatchRow { idx_detected: 0, idx_catalog: 0, separation_arcsec: 1.0, dra_arcsec: 1.0, ddec_arcsec: -1.0, flux_ratio: Some(1.1) },
            MatchRow { idx_detected: 1, idx_catalog: 1, separation_arcsec: 1.0, dra_arcsec: 3.0, ddec_arcsec: -3.0, flux_ratio: Some(0.9) },
        ];
        let stats = bulk_statistics(&rows);
        assert_eq!(stats.median_dra_arcsec, 3.0);
        assert!(stats.flux_scale_correction.is_some());
    }
}
