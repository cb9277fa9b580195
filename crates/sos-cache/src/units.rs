use async_trait::async_trait;
use sos_core::{DataSource, PropertyUnitMapping, SourceError, UnitOfMeasure};

use crate::entity::{CachedEntity, EntityCache};
use crate::error::{CacheError, Result};

/// Property → unit-of-measure cache. Registered first: building offerings
/// may consult it.
pub type PropertyUnitMappingCache = EntityCache<PropertyUnitMapping>;

#[async_trait]
impl CachedEntity for PropertyUnitMapping {
    const NAME: &'static str = "property-unit-mappings";
    const FILE_NAME: &'static str = "propertyUnitMappings.cache";
    const FIELD_COUNT: usize = 3;

    fn id(&self) -> &str {
        &self.property
    }

    fn encode_fields(&self) -> Result<Vec<String>> {
        if self.property.is_empty() {
            return Err(CacheError::encode(Self::NAME, "empty property id"));
        }
        Ok(vec![
            self.property.clone(),
            self.unit.code.clone(),
            self.unit.label.clone(),
        ])
    }

    fn decode_fields(fields: &[String]) -> Option<Self> {
        let [property, code, label] = fields else {
            return None;
        };
        Some(PropertyUnitMapping {
            property: property.clone(),
            unit: UnitOfMeasure {
                code: code.clone(),
                label: label.clone(),
            },
        })
    }

    async fn fetch(source: &dyn DataSource) -> std::result::Result<Vec<Self>, SourceError> {
        source.property_unit_mappings().await
    }
}
