use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use geocopilot_types::{Capabilities, Capability, ReferenceSystem};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Point { x: f64, y: f64 },
    LineString { coords: Vec<[f64; 2]> },
    Polygon { rings: Vec<Vec<[f64; 2]>> },
}

impl Geometry {
    pub fn is_valid(&self) -> bool {
        let finite = |c: &[f64; 2]| c[0].is_finite() && c[1].is_finite();
        match self {
            Geometry::Point { x, y } => x.is_finite() && y.is_finite(),
            Geometry::LineString { coords } => coords.len() >= 2 && coords.iter().all(finite),
            Geometry::Polygon { rings } => {
                !rings.is_empty()
                    && rings.iter().all(|ring| {
                        ring.len() >= 4 && ring.iter().all(finite) && ring.first() == ring.last()
                    })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Real,
    Text,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

/// A feature not yet assigned an id by its source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewFeature {
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

impl NewFeature {
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureEdit {
    AddFeature { feature: NewFeature },
    DeleteFeature { id: u64 },
    ChangeAttribute { id: u64, name: String, value: Value },
    AddAttribute { field: Field },
    ChangeGeometry { id: u64, geometry: Geometry },
}

impl FeatureEdit {
    pub fn capability(&self) -> Capability {
        match self {
            FeatureEdit::AddFeature { .. } => Capability::AddFeatures,
            FeatureEdit::DeleteFeature { .. } => Capability::DeleteFeatures,
            FeatureEdit::ChangeAttribute { .. } => Capability::ChangeAttributes,
            FeatureEdit::AddAttribute { .. } => Capability::AddAttributes,
            FeatureEdit::ChangeGeometry { .. } => Capability::ChangeGeometries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub provider: String,
    pub read_only: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum SourceError {
    #[error("source `{0}` is read-only")]
    ReadOnly(String),
    #[error("source `{source_id}` does not support {capability:?}")]
    Unsupported {
        source_id: String,
        capability: Capability,
    },
    #[error("feature {0} does not exist")]
    FeatureNotFound(u64),
    #[error("field `{0}` does not exist")]
    FieldNotFound(String),
    #[error("field `{0}` already exists")]
    DuplicateField(String),
    #[error("geometry rejected: {0}")]
    InvalidGeometry(String),
    #[error("source state is unavailable: {0}")]
    Unavailable(String),
}

/// A layer-like handle the validator and edit sessions operate on.
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn connector(&self) -> ConnectorInfo;
    fn is_valid(&self) -> bool;
    fn capabilities(&self) -> Capabilities;
    fn reference_system(&self) -> Option<ReferenceSystem>;
    fn fields(&self) -> Vec<Field>;
    fn features(&self) -> Vec<Feature>;
    /// Applies every edit or none of them.
    fn apply_edits(&self, edits: &[FeatureEdit]) -> Result<(), SourceError>;

    fn feature_count(&self) -> usize {
        self.features().len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LayerState {
    fields: Vec<Field>,
    features: Vec<Feature>,
    next_id: u64,
}

impl LayerState {
    fn apply(&mut self, edit: &FeatureEdit) -> Result<(), SourceError> {
        match edit {
            FeatureEdit::AddFeature { feature } => {
                check_geometry(feature.geometry.as_ref())?;
                for name in feature.attributes.keys() {
                    self.require_field(name)?;
                }
                self.next_id += 1;
                self.features.push(Feature {
                    id: self.next_id,
                    attributes: feature.attributes.clone(),
                    geometry: feature.geometry.clone(),
                });
            }
            FeatureEdit::DeleteFeature { id } => {
                let before = self.features.len();
                self.features.retain(|f| f.id != *id);
                if self.features.len() == before {
                    return Err(SourceError::FeatureNotFound(*id));
                }
            }
            FeatureEdit::ChangeAttribute { id, name, value } => {
                self.require_field(name)?;
                let feature = self.feature_mut(*id)?;
                feature.attributes.insert(name.clone(), value.clone());
            }
            FeatureEdit::AddAttribute { field } => {
                if self.fields.iter().any(|f| f.name == field.name) {
                    return Err(SourceError::DuplicateField(field.name.clone()));
                }
                self.fields.push(field.clone());
            }
            FeatureEdit::ChangeGeometry { id, geometry } => {
                check_geometry(Some(geometry))?;
                let feature = self.feature_mut(*id)?;
                feature.geometry = Some(geometry.clone());
            }
        }
        Ok(())
    }

    fn require_field(&self, name: &str) -> Result<(), SourceError> {
        if self.fields.iter().any(|f| f.name == name) {
            Ok(())
        } else {
            Err(SourceError::FieldNotFound(name.to_string()))
        }
    }

    fn feature_mut(&mut self, id: u64) -> Result<&mut Feature, SourceError> {
        self.features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(SourceError::FeatureNotFound(id))
    }
}

fn check_geometry(geometry: Option<&Geometry>) -> Result<(), SourceError> {
    match geometry {
        Some(g) if !g.is_valid() => Err(SourceError::InvalidGeometry(format!("{g:?}"))),
        _ => Ok(()),
    }
}

/// In-memory vector layer. Committed state is held behind a lock and swapped
/// wholesale so readers never observe a partially applied batch.
pub struct MemoryLayer {
    id: String,
    name: String,
    connector: ConnectorInfo,
    capabilities: Capabilities,
    reference_system: Option<ReferenceSystem>,
    valid: bool,
    state: RwLock<LayerState>,
}

impl MemoryLayer {
    pub fn new(id: impl Into<String>, fields: Vec<Field>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            connector: ConnectorInfo {
                provider: "memory".to_string(),
                read_only: false,
            },
            capabilities: Capabilities::all(),
            reference_system: Some(ReferenceSystem::epsg(4326)),
            valid: true,
            state: RwLock::new(LayerState {
                fields,
                features: Vec::new(),
                next_id: 0,
            }),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_connector(mut self, provider: impl Into<String>, read_only: bool) -> Self {
        self.connector = ConnectorInfo {
            provider: provider.into(),
            read_only,
        };
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_reference_system(mut self, reference_system: Option<ReferenceSystem>) -> Self {
        self.reference_system = reference_system;
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Seeds features directly, bypassing capability checks.
    pub fn with_features(self, features: Vec<NewFeature>) -> Self {
        if let Ok(mut state) = self.state.write() {
            for feature in features {
                state.next_id += 1;
                let id = state.next_id;
                state.features.push(Feature {
                    id,
                    attributes: feature.attributes,
                    geometry: feature.geometry,
                });
            }
        }
        self
    }

    /// Serialized committed state, used to persist or compare snapshots.
    pub fn persisted_bytes(&self) -> Result<Vec<u8>, SourceError> {
        let state = self
            .state
            .read()
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        serde_json::to_vec(&*state).map_err(|err| SourceError::Unavailable(err.to_string()))
    }
}

impl DataSource for MemoryLayer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connector(&self) -> ConnectorInfo {
        self.connector.clone()
    }

    fn is_valid(&self) -> bool {
        self.valid && self.state.read().is_ok()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn reference_system(&self) -> Option<ReferenceSystem> {
        self.reference_system.clone()
    }

    fn fields(&self) -> Vec<Field> {
        self.state
            .read()
            .map(|s| s.fields.clone())
            .unwrap_or_default()
    }

    fn features(&self) -> Vec<Feature> {
        self.state
            .read()
            .map(|s| s.features.clone())
            .unwrap_or_default()
    }

    fn apply_edits(&self, edits: &[FeatureEdit]) -> Result<(), SourceError> {
        if self.connector.read_only {
            return Err(SourceError::ReadOnly(self.id.clone()));
        }
        if let Some(edit) = edits
            .iter()
            .find(|e| !self.capabilities.contains(e.capability()))
        {
            return Err(SourceError::Unsupported {
                source_id: self.id.clone(),
                capability: edit.capability(),
            });
        }
        let mut state = self
            .state
            .write()
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        let mut staged = state.clone();
        for edit in edits {
            staged.apply(edit)?;
        }
        *state = staged;
        Ok(())
    }
}

/// Process-wide registry of the sources scripts may reference by id.
#[derive(Clone, Default)]
pub struct SourceCatalog {
    sources: Arc<RwLock<HashMap<String, Arc<dyn DataSource>>>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn DataSource>) {
        if let Ok(mut sources) = self.sources.write() {
            sources.insert(source.id().to_string(), source);
        }
    }

    pub fn remove(&self, source_id: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.write().ok()?.remove(source_id)
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.read().ok()?.get(source_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = self
            .sources
            .read()
            .map(|s| s.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}
