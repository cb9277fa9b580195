//! Observation offering cache.
//!
//! Record layout (6 fields):
//! `id @@ name @@ procedure @@ envelope @@ observed properties @@ time period`
//!
//! * envelope: `crs;minx,miny;maxx,maxy`
//! * observed properties: list encoding from [`crate::record::encode_list`]
//! * time period: `start/end`, both RFC 3339

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sos_core::{DataSource, Envelope, ObservationOffering, SourceError, TimePeriod};

use crate::entity::{CachedEntity, EntityCache};
use crate::error::{CacheError, Result};
use crate::record::{decode_list, encode_list};

pub type ObservationOfferingCache = EntityCache<ObservationOffering>;

pub(crate) fn encode_envelope(env: &Envelope) -> Result<String> {
    let coords = [env.lower[0], env.lower[1], env.upper[0], env.upper[1]];
    if let Some(bad) = coords.iter().find(|c| !c.is_finite()) {
        return Err(CacheError::encode(
            ObservationOffering::NAME,
            format!("non-finite envelope coordinate {bad}"),
        ));
    }
    if env.crs.contains(';') {
        return Err(CacheError::encode(
            ObservationOffering::NAME,
            format!("crs {:?} contains ';'", env.crs),
        ));
    }
    Ok(format!(
        "{};{},{};{},{}",
        env.crs, coords[0], coords[1], coords[2], coords[3]
    ))
}

pub(crate) fn decode_envelope(value: &str) -> Option<Envelope> {
    let mut parts = value.split(';');
    let crs = parts.next()?.to_string();
    let lower = decode_point(parts.next()?)?;
    let upper = decode_point(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(Envelope { crs, lower, upper })
}

fn decode_point(value: &str) -> Option<[f64; 2]> {
    let (x, y) = value.split_once(',')?;
    Some([x.parse().ok()?, y.parse().ok()?])
}

pub(crate) fn encode_time_period(period: &TimePeriod) -> String {
    period.to_string()
}

pub(crate) fn decode_time_period(value: &str) -> Option<TimePeriod> {
    let (start, end) = value.split_once('/')?;
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    };
    Some(TimePeriod {
        start: parse(start)?,
        end: parse(end)?,
    })
}

#[async_trait]
impl CachedEntity for ObservationOffering {
    const NAME: &'static str = "observation-offerings";
    const FILE_NAME: &'static str = "observationOfferings.cache";
    const FIELD_COUNT: usize = 6;

    fn id(&self) -> &str {
        &self.id
    }

    fn encode_fields(&self) -> Result<Vec<String>> {
        if self.id.is_empty() {
            return Err(CacheError::encode(Self::NAME, "empty offering id"));
        }
        if self.observed_properties.iter().any(String::is_empty) {
            return Err(CacheError::encode(
                Self::NAME,
                format!("offering {} has an empty observed property", self.id),
            ));
        }
        Ok(vec![
            self.id.clone(),
            self.name.clone(),
            self.procedure.clone(),
            encode_envelope(&self.observed_area)?,
            encode_list(&self.observed_properties),
            encode_time_period(&self.time_extent),
        ])
    }

    fn decode_fields(fields: &[String]) -> Option<Self> {
        let [id, name, procedure, envelope, properties, time] = fields else {
            return None;
        };
        Some(ObservationOffering {
            id: id.clone(),
            name: name.clone(),
            procedure: procedure.clone(),
            observed_area: decode_envelope(envelope)?,
            observed_properties: decode_list(properties).ok()?,
            time_extent: decode_time_period(time)?,
        })
    }

    async fn fetch(source: &dyn DataSource) -> std::result::Result<Vec<Self>, SourceError> {
        source.observation_offerings().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use proptest::prelude::*;
    use sos_core::FixedDirectory;

    use super::*;

    fn offering(id: &str) -> ObservationOffering {
        ObservationOffering {
            id: id.to_string(),
            name: format!("Network {id}"),
            procedure: format!("urn:procedure:{id}"),
            observed_area: Envelope {
                crs: "EPSG:4326".to_string(),
                lower: [-10.5, 35.25],
                upper: [30.0, 71.125],
            },
            observed_properties: vec!["NO2".to_string(), "PM10,coarse".to_string()],
            time_extent: TimePeriod {
                start: Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2013, 6, 30, 23, 59, 59).unwrap(),
            },
        }
    }

    #[test]
    fn envelope_text_round_trip() {
        let env = offering("a").observed_area;
        let text = encode_envelope(&env).unwrap();
        assert_eq!(text, "EPSG:4326;-10.5,35.25;30,71.125");
        assert_eq!(decode_envelope(&text), Some(env));
    }

    #[test]
    fn non_finite_envelope_is_encode_error() {
        let mut o = offering("a");
        o.observed_area.upper[1] = f64::NAN;
        assert!(matches!(o.encode_fields(), Err(CacheError::Encode { .. })));
    }

    #[test]
    fn time_period_round_trip() {
        let period = offering("a").time_extent;
        assert_eq!(decode_time_period(&encode_time_period(&period)), Some(period));
        assert_eq!(decode_time_period("2012-01-01T00:00:00Z"), None);
    }

    #[test]
    fn cache_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache =
            ObservationOfferingCache::open(&FixedDirectory::new(tmp.path()), Duration::from_secs(900))
                .unwrap();
        let entities = vec![offering("net-1"), offering("net@@2")];
        cache.persist(&entities).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.len(), entities.len());
        for e in &entities {
            assert_eq!(loaded[&e.id].as_ref(), Some(e));
        }
    }

    #[test]
    fn encode_failure_keeps_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache =
            ObservationOfferingCache::open(&FixedDirectory::new(tmp.path()), Duration::from_secs(900))
                .unwrap();
        cache.persist(&[offering("net-1")]).unwrap();
        let before = std::fs::read_to_string(cache.file_path()).unwrap();

        let mut broken = offering("net-2");
        broken.observed_area.lower[0] = f64::INFINITY;
        assert!(cache.persist(&[offering("net-3"), broken]).is_err());

        assert_eq!(std::fs::read_to_string(cache.file_path()).unwrap(), before);
        assert!(cache.get("net-1").is_some());
        assert!(cache.get("net-3").is_none());
    }

    #[test]
    fn bad_envelope_field_is_hole() {
        let tmp = tempfile::tempdir().unwrap();
        let cache =
            ObservationOfferingCache::open(&FixedDirectory::new(tmp.path()), Duration::from_secs(900))
                .unwrap();
        std::fs::write(
            cache.file_path(),
            "net-1@@Net@@proc@@not-an-envelope@@NO2@@2012-01-01T00:00:00+00:00/2013-01-01T00:00:00+00:00\n",
        )
        .unwrap();

        let loaded = cache.load().unwrap();
        assert!(loaded["net-1"].is_none());
    }

    fn text() -> impl Strategy<Value = String> {
        r"[a-zA-Z0-9 @\\,;/:\n\r]{0,10}"
    }

    fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..4_000_000_000, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| Utc.timestamp_opt(secs, nanos).unwrap())
    }

    fn coordinate() -> impl Strategy<Value = f64> {
        -1.0e7f64..1.0e7
    }

    fn offering_body() -> impl Strategy<Value = ObservationOffering> {
        (
            (text(), text()),
            r"[a-zA-Z0-9 @\\,/:\n\r]{0,10}",
            prop::array::uniform4(coordinate()),
            prop::collection::vec(r"[a-zA-Z0-9 @\\,;/\n\r]{1,8}", 0..4),
            (timestamp(), timestamp()),
        )
            .prop_map(|((name, procedure), crs, c, observed_properties, (start, end))| {
                ObservationOffering {
                    id: String::new(),
                    name,
                    procedure,
                    observed_area: Envelope {
                        crs,
                        lower: [c[0], c[1]],
                        upper: [c[2], c[3]],
                    },
                    observed_properties,
                    time_extent: TimePeriod { start, end },
                }
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_persist_then_load(
            bodies in prop::collection::hash_map(r"[a-zA-Z0-9 @\\,;/\n\r]{1,10}", offering_body(), 0..5)
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let cache =
                ObservationOfferingCache::open(&FixedDirectory::new(tmp.path()), Duration::from_secs(900))
                    .unwrap();
            let entities: Vec<ObservationOffering> = bodies
                .into_iter()
                .map(|(id, body)| ObservationOffering { id, ..body })
                .collect();
            cache.persist(&entities).unwrap();

            let loaded = cache.load().unwrap();
            prop_assert_eq!(loaded.len(), entities.len());
            for e in &entities {
                prop_assert_eq!(loaded[&e.id].as_ref(), Some(e));
            }
        }
    }
}
