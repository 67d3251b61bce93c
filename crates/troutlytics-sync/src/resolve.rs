//! Location resolver: finds, or optionally creates, the registry entry for a cleaned name.
//!
//! Matching runs in two passes against an index built once per run. The exact pass compares
//! canonical names (registry names and recorded aliases, both re-cleaned). The relaxed pass
//! compares token sets with the tokens in `RELAXED_IGNORED_TOKENS` removed and only accepts a
//! single candidate.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};
use troutlytics_core::{Coordinates, LocationId, NewWaterLocation, WaterLocation};
use troutlytics_storage::{GeocodeError, Geocoder, LocationRegistry, StoreError};
use url::Url;

use crate::normalize::clean_water_name;

/// Bump whenever `RELAXED_IGNORED_TOKENS` or `relaxed_key` change; historical matches were
/// made under the previous rule.
pub const RELAXED_MATCH_RULE_VERSION: u32 = 1;

pub const RELAXED_IGNORED_TOKENS: &[&str] = &[
    "lake",
    "lakes",
    "pond",
    "ponds",
    "reservoir",
    "reservoirs",
];

/// Appended to names sent to the geocoder and the maps link.
pub const REGION_SUFFIX: &str = "Washington State";

const MAPS_SEARCH_URL: &str = "https://www.google.com/maps/search/";
const NEAR_MISS_THRESHOLD: f64 = 0.90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    MatchedExact,
    MatchedRelaxed,
    Created,
    AmbiguousNoMatch,
    SkippedNoLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeWarning {
    pub location_id: LocationId,
    pub water_name_raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub location_id: Option<LocationId>,
    pub outcome: ResolveOutcome,
    pub warning: Option<GeocodeWarning>,
}

impl Resolution {
    fn found(id: LocationId, outcome: ResolveOutcome) -> Self {
        Self {
            location_id: Some(id),
            outcome,
            warning: None,
        }
    }

    fn unresolved(outcome: ResolveOutcome) -> Self {
        Self {
            location_id: None,
            outcome,
            warning: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverOptions {
    /// Create a registry entry when nothing matches. Off by default: unmatched rows are skipped.
    pub allow_create: bool,
    pub geocode_enabled: bool,
}

/// Token-set key for relaxed comparison. `None` when only ignored tokens remain.
pub fn relaxed_key(canonical: &str) -> Option<String> {
    let tokens = canonical
        .split_whitespace()
        .filter(|t| !RELAXED_IGNORED_TOKENS.contains(t))
        .collect::<BTreeSet<_>>();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.into_iter().collect::<Vec<_>>().join(" "))
    }
}

pub fn maps_search_url(water_name_cleaned: &str) -> Option<String> {
    let query = format!("{water_name_cleaned} {REGION_SUFFIX}");
    Url::parse_with_params(MAPS_SEARCH_URL, &[("api", "1"), ("query", query.as_str())])
        .ok()
        .map(String::from)
}

pub struct LocationResolver {
    options: ResolverOptions,
    geocoder: Option<Arc<dyn Geocoder>>,
    exact: HashMap<String, BTreeSet<LocationId>>,
    relaxed: HashMap<String, BTreeSet<LocationId>>,
    names: BTreeMap<LocationId, String>,
}

impl LocationResolver {
    pub fn new(options: ResolverOptions, geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        Self {
            options,
            geocoder,
            exact: HashMap::new(),
            relaxed: HashMap::new(),
            names: BTreeMap::new(),
        }
    }

    /// Builds the per-run index from the full registry.
    pub async fn load<R>(
        registry: &R,
        options: ResolverOptions,
        geocoder: Option<Arc<dyn Geocoder>>,
    ) -> Result<Self, StoreError>
    where
        R: LocationRegistry + ?Sized,
    {
        let locations = registry.all_locations().await?;
        let mut resolver = Self::new(options, geocoder);
        for location in &locations {
            resolver.index_location(location);
        }
        info!(
            locations = locations.len(),
            relaxed_rule = RELAXED_MATCH_RULE_VERSION,
            "indexed water locations"
        );
        Ok(resolver)
    }

    pub fn index_location(&mut self, location: &WaterLocation) {
        let canonical = clean_water_name(&location.water_name_cleaned);
        self.names.insert(location.id, canonical.clone());
        self.index_name(location.id, &canonical);
        for alias in &location.aliases {
            self.index_name(location.id, &clean_water_name(alias));
        }
    }

    fn index_name(&mut self, id: LocationId, canonical: &str) {
        if canonical.is_empty() {
            return;
        }
        self.exact.entry(canonical.to_string()).or_default().insert(id);
        if let Some(key) = relaxed_key(canonical) {
            self.relaxed.entry(key).or_default().insert(id);
        }
    }

    pub async fn resolve<R>(
        &mut self,
        registry: &R,
        water_name_cleaned: &str,
        water_name_raw: &str,
    ) -> Result<Resolution, StoreError>
    where
        R: LocationRegistry + ?Sized,
    {
        if let Some(id) = self
            .exact
            .get(water_name_cleaned)
            .and_then(|ids| ids.first().copied())
        {
            debug!(%id, name = water_name_cleaned, "exact match");
            return Ok(Resolution::found(id, ResolveOutcome::MatchedExact));
        }

        let candidates = relaxed_key(water_name_cleaned)
            .and_then(|key| self.relaxed.get(&key))
            .map(|ids| ids.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        match candidates.as_slice() {
            [] => {}
            [id] => {
                let id = *id;
                registry.append_alias(id, water_name_raw).await?;
                self.index_name(id, water_name_cleaned);
                info!(%id, raw = water_name_raw, "relaxed match; alias recorded");
                return Ok(Resolution::found(id, ResolveOutcome::MatchedRelaxed));
            }
            _ => {
                let names = candidates
                    .iter()
                    .filter_map(|id| self.names.get(id).map(|n| format!("{id}:{n}")))
                    .collect::<Vec<_>>();
                warn!(
                    raw = water_name_raw,
                    candidates = ?names,
                    "ambiguous relaxed match; row skipped"
                );
                return Ok(Resolution::unresolved(ResolveOutcome::AmbiguousNoMatch));
            }
        }

        if let Some((id, score)) = self.nearest_name(water_name_cleaned) {
            let existing = self.names.get(&id).map(String::as_str).unwrap_or_default();
            info!(
                raw = water_name_raw,
                nearest = existing,
                score,
                "no registry match; closest known name"
            );
        }

        if !self.options.allow_create {
            warn!(raw = water_name_raw, "no water location and creation disabled; row skipped");
            return Ok(Resolution::unresolved(ResolveOutcome::SkippedNoLocation));
        }

        self.create(registry, water_name_cleaned, water_name_raw).await
    }

    async fn create<R>(
        &mut self,
        registry: &R,
        water_name_cleaned: &str,
        water_name_raw: &str,
    ) -> Result<Resolution, StoreError>
    where
        R: LocationRegistry + ?Sized,
    {
        // Another writer may have added it since the index was loaded. Both lookups are exact
        // name matches against the store, so a hit counts as `MatchedExact`.
        let existing = match registry.find_by_canonical_name(water_name_cleaned).await? {
            Some(location) => Some(location),
            None => registry.find_by_alias(water_name_raw).await?,
        };
        if let Some(location) = existing {
            self.index_location(&location);
            return Ok(Resolution::found(location.id, ResolveOutcome::MatchedExact));
        }

        let mut failure = None;
        let coordinates = if self.options.geocode_enabled {
            match self.geocode(water_name_raw).await {
                Ok(Some(coordinates)) => Some(coordinates),
                Ok(None) => {
                    failure = Some("no geocoding result".to_string());
                    None
                }
                Err(err) => {
                    failure = Some(err.to_string());
                    None
                }
            }
        } else {
            None
        };

        let location = registry
            .insert_location(NewWaterLocation {
                water_name_cleaned: water_name_cleaned.to_string(),
                original_name: water_name_raw.to_string(),
                coordinates,
                directions: maps_search_url(water_name_cleaned),
            })
            .await?;
        self.index_location(&location);
        info!(id = %location.id, name = water_name_cleaned, geocoded = coordinates.is_some(), "created water location");

        let warning = failure.map(|reason| {
            warn!(id = %location.id, raw = water_name_raw, %reason, "geocoding failed; location kept without coordinates");
            GeocodeWarning {
                location_id: location.id,
                water_name_raw: water_name_raw.to_string(),
                reason,
            }
        });
        Ok(Resolution {
            location_id: Some(location.id),
            outcome: ResolveOutcome::Created,
            warning,
        })
    }

    async fn geocode(
        &self,
        water_name_raw: &str,
    ) -> Result<Option<Coordinates>, GeocodeError> {
        let geocoder = self.geocoder.as_ref().ok_or(GeocodeError::Unconfigured)?;
        geocoder
            .geocode(&format!("{water_name_raw} {REGION_SUFFIX}"))
            .await
    }

    fn nearest_name(&self, water_name_cleaned: &str) -> Option<(LocationId, f64)> {
        self.names
            .iter()
            .map(|(id, name)| (*id, jaro_winkler(water_name_cleaned, name)))
            .filter(|(_, score)| *score >= NEAR_MISS_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use troutlytics_storage::InMemoryStore;

    struct FixedGeocoder(Result<Option<Coordinates>, ()>);

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.0.map_err(|_| GeocodeError::RateLimited)
        }
    }

    async fn resolver(store: &InMemoryStore, options: ResolverOptions) -> LocationResolver {
        LocationResolver::load(store, options, None).await.unwrap()
    }

    #[test]
    fn relaxed_key_drops_water_body_suffixes_and_orders_tokens() {
        assert_eq!(relaxed_key("battle ground lake").as_deref(), Some("battle ground"));
        assert_eq!(relaxed_key("lake ground battle").as_deref(), Some("battle ground"));
        assert_eq!(relaxed_key("klineline pond").as_deref(), Some("klineline"));
        assert_eq!(relaxed_key("lake"), None);
    }

    #[test]
    fn maps_link_encodes_the_query() {
        assert_eq!(
            maps_search_url("battle ground lake").as_deref(),
            Some("https://www.google.com/maps/search/?api=1&query=battle+ground+lake+Washington+State")
        );
    }

    #[tokio::test]
    async fn exact_match_wins_over_relaxed() {
        let store = InMemoryStore::new();
        let exact = store.seed_location("mineral lake", &[]).await;
        let _relaxed_only = store.seed_location("mineral pond", &[]).await;
        let mut resolver = resolver(&store, ResolverOptions::default()).await;

        let resolution = resolver
            .resolve(&store, "mineral lake", "Mineral Lk")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::MatchedExact);
        assert_eq!(resolution.location_id, Some(exact));
    }

    #[tokio::test]
    async fn location_added_after_load_is_found_before_creating() {
        let store = InMemoryStore::new();
        let options = ResolverOptions {
            allow_create: true,
            geocode_enabled: false,
        };
        let mut resolver = resolver(&store, options).await;
        let id = store.seed_location("lake odell", &["Odell Lk"]).await;

        let resolution = resolver
            .resolve(&store, "odell lake", "Odell Lk")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::MatchedExact);
        assert_eq!(resolution.location_id, Some(id));
        assert_eq!(store.locations().await.len(), 1);

        let again = resolver.resolve(&store, "odell lake", "Odell Lk").await.unwrap();
        assert_eq!(again.location_id, Some(id));
    }

    #[tokio::test]
    async fn exact_pass_sees_recorded_aliases() {
        let store = InMemoryStore::new();
        let id = store.seed_location("lake sacajawea", &["Sacajawea Lk (Cowlitz)"]).await;
        let mut resolver = resolver(&store, ResolverOptions::default()).await;

        let resolution = resolver
            .resolve(&store, "sacajawea lake", "Sacajawea Lake")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::MatchedExact);
        assert_eq!(resolution.location_id, Some(id));
    }

    #[tokio::test]
    async fn single_relaxed_candidate_records_alias() {
        let store = InMemoryStore::new();
        let id = store.seed_location("battle ground lake", &[]).await;
        let mut resolver = resolver(&store, ResolverOptions::default()).await;

        let first = resolver
            .resolve(&store, "battle ground", "Battle Ground")
            .await
            .unwrap();
        assert_eq!(first.outcome, ResolveOutcome::MatchedRelaxed);
        assert_eq!(first.location_id, Some(id));
        assert!(store.locations().await[0].aliases.contains("Battle Ground"));

        let again = resolver
            .resolve(&store, "battle ground", "Battle Ground")
            .await
            .unwrap();
        assert_eq!(again.outcome, ResolveOutcome::MatchedExact);
    }

    #[tokio::test]
    async fn ambiguous_relaxed_match_mutates_nothing() {
        let store = InMemoryStore::new();
        store.seed_location("horseshoe lake", &[]).await;
        store.seed_location("horseshoe pond", &[]).await;
        let before = store.locations().await;
        let mut resolver = resolver(
            &store,
            ResolverOptions {
                allow_create: true,
                geocode_enabled: false,
            },
        )
        .await;

        let resolution = resolver
            .resolve(&store, "horseshoe reservoir", "Horseshoe Res")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::AmbiguousNoMatch);
        assert_eq!(resolution.location_id, None);
        assert_eq!(store.locations().await, before);
    }

    #[tokio::test]
    async fn creation_disabled_skips_unknown_names() {
        let store = InMemoryStore::new();
        let mut resolver = resolver(&store, ResolverOptions::default()).await;

        let resolution = resolver
            .resolve(&store, "swift reservoir", "Swift Reservoir")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::SkippedNoLocation);
        assert!(store.locations().await.is_empty());
    }

    #[tokio::test]
    async fn created_location_carries_coordinates_and_directions() {
        let store = InMemoryStore::new();
        let geocoder: Arc<dyn Geocoder> = Arc::new(FixedGeocoder(Ok(Some(Coordinates {
            latitude: 46.07,
            longitude: -122.2,
        }))));
        let mut resolver = LocationResolver::load(
            &store,
            ResolverOptions {
                allow_create: true,
                geocode_enabled: true,
            },
            Some(geocoder),
        )
        .await
        .unwrap();

        let resolution = resolver
            .resolve(&store, "swift reservoir", "Swift Reservoir")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::Created);
        assert!(resolution.warning.is_none());

        let created = &store.locations().await[0];
        assert_eq!(Some(created.id), resolution.location_id);
        assert_eq!(created.coordinates.map(|c| c.latitude), Some(46.07));
        assert!(created.directions.as_deref().unwrap().contains("swift+reservoir"));

        let again = resolver
            .resolve(&store, "swift reservoir", "Swift Reservoir")
            .await
            .unwrap();
        assert_eq!(again.outcome, ResolveOutcome::MatchedExact);
        assert_eq!(store.locations().await.len(), 1);
    }

    #[tokio::test]
    async fn geocode_failure_still_creates() {
        let store = InMemoryStore::new();
        let geocoder: Arc<dyn Geocoder> = Arc::new(FixedGeocoder(Err(())));
        let mut resolver = LocationResolver::load(
            &store,
            ResolverOptions {
                allow_create: true,
                geocode_enabled: true,
            },
            Some(geocoder),
        )
        .await
        .unwrap();

        let resolution = resolver
            .resolve(&store, "merwin reservoir", "Merwin Res")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::Created);
        let warning = resolution.warning.expect("warning recorded");
        assert_eq!(Some(warning.location_id), resolution.location_id);
        assert!(warning.reason.contains("rate limit"));
        assert!(store.locations().await[0].coordinates.is_none());
    }

    #[tokio::test]
    async fn missing_geocoder_is_a_warning() {
        let store = InMemoryStore::new();
        let mut resolver = resolver(
            &store,
            ResolverOptions {
                allow_create: true,
                geocode_enabled: true,
            },
        )
        .await;

        let resolution = resolver
            .resolve(&store, "merwin reservoir", "Merwin Res")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::Created);
        assert_eq!(
            resolution.warning.map(|w| w.reason).as_deref(),
            Some("no geocoder configured")
        );
    }

    #[tokio::test]
    async fn creation_rechecks_the_registry() {
        let store = InMemoryStore::new();
        let mut resolver = resolver(
            &store,
            ResolverOptions {
                allow_create: true,
                geocode_enabled: false,
            },
        )
        .await;
        let added_later = store.seed_location("klineline pond", &[]).await;

        let resolution = resolver
            .resolve(&store, "klineline pond", "Klineline Pd")
            .await
            .unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::MatchedExact);
        assert_eq!(resolution.location_id, Some(added_later));
        assert_eq!(store.locations().await.len(), 1);
    }
}
