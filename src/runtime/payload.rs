/// Payload items flowing between stages
///
/// A stage emits items of exactly one kind. Spatial items also carry their CRS so the
/// boundary between stages can verify that a stream stays homogeneous.
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Coordinate reference system tag, normalized to `AUTHORITY:CODE` when possible
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(String);

impl Crs {
    /// Parse `EPSG:4326`, `epsg:4326`, `4326` or a `urn:ogc:def:crs:EPSG::4326` name
    pub fn parse(text: &str) -> Crs {
        let trimmed = text.trim();
        if let Ok(code) = trimmed.parse::<u32>() {
            return Crs(format!("EPSG:{}", code));
        }
        if let Some(code) = trimmed.rsplit("::").next().filter(|_| trimmed.contains("::")) {
            if code.parse::<u32>().is_ok() {
                return Crs(format!("EPSG:{}", code));
            }
        }
        match trimmed.split_once(':') {
            Some((authority, code)) if code.parse::<u32>().is_ok() => {
                Crs(format!("{}:{}", authority.to_ascii_uppercase(), code))
            }
            _ => Crs(trimmed.to_string()),
        }
    }

    pub fn wgs84() -> Crs {
        Crs("EPSG:4326".to_string())
    }

    pub fn epsg(&self) -> Option<u32> {
        self.0.strip_prefix("EPSG:").and_then(|c| c.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Geometry + attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<i64>,
    /// GeoJSON geometry object
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub crs: Crs,
}

impl VectorRecord {
    pub fn new(geometry: Value, properties: Map<String, Value>, crs: Crs) -> Self {
        Self {
            fid: None,
            geometry,
            properties,
            crs,
        }
    }

    /// GeoJSON `Feature` representation
    pub fn to_feature(&self) -> Value {
        let mut feature = json!({
            "type": "Feature",
            "properties": self.properties,
            "geometry": self.geometry,
        });
        if let Some(fid) = self.fid {
            feature["id"] = json!(fid);
        }
        feature
    }

    /// Build a record from a GeoJSON `Feature`
    pub fn from_feature(feature: &Value, crs: &Crs) -> anyhow::Result<Self> {
        if feature.get("type").and_then(Value::as_str) != Some("Feature") {
            anyhow::bail!("expected a GeoJSON Feature, found {}", short_json(feature));
        }
        Ok(Self {
            fid: feature.get("id").and_then(Value::as_i64),
            geometry: feature.get("geometry").cloned().unwrap_or(Value::Null),
            properties: feature
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            crs: crs.clone(),
        })
    }

    /// Bounding box `[minx, miny, maxx, maxy]` of the geometry
    pub fn envelope(&self) -> Option<[f64; 4]> {
        geometry_envelope(&self.geometry)
    }
}

/// Per-band metadata of a raster chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
}

/// A window of raster data, band-sequential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterChunk {
    pub width: usize,
    pub height: usize,
    /// GDAL-style affine transform
    pub geotransform: [f64; 6],
    pub crs: Crs,
    pub bands: Vec<BandInfo>,
    /// `bands.len() * width * height` values
    pub data: Vec<f64>,
}

/// Attribute-only record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableRow {
    pub fields: Map<String, Value>,
}

/// Tag of a payload item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Vector,
    Raster,
    Table,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Vector => "vector",
            PayloadKind::Raster => "raster",
            PayloadKind::Table => "table",
        };
        f.write_str(name)
    }
}

/// Item flowing out of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PayloadItem {
    Vector(VectorRecord),
    Raster(RasterChunk),
    Table(TableRow),
}

impl PayloadItem {
    pub fn kind(&self) -> PayloadKind {
        match self {
            PayloadItem::Vector(_) => PayloadKind::Vector,
            PayloadItem::Raster(_) => PayloadKind::Raster,
            PayloadItem::Table(_) => PayloadKind::Table,
        }
    }

    /// CRS of spatial payloads, `None` for table rows
    pub fn crs(&self) -> Option<&Crs> {
        match self {
            PayloadItem::Vector(record) => Some(&record.crs),
            PayloadItem::Raster(chunk) => Some(&chunk.crs),
            PayloadItem::Table(_) => None,
        }
    }

    /// Attribute map of vector and table payloads
    pub fn attributes(&self) -> Option<&Map<String, Value>> {
        match self {
            PayloadItem::Vector(record) => Some(&record.properties),
            PayloadItem::Table(row) => Some(&row.fields),
            PayloadItem::Raster(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&VectorRecord> {
        match self {
            PayloadItem::Vector(record) => Some(record),
            _ => None,
        }
    }
}

/// Fold every coordinate pair of a GeoJSON geometry into an envelope
pub fn geometry_envelope(geometry: &Value) -> Option<[f64; 4]> {
    let mut envelope: Option<[f64; 4]> = None;
    visit_positions(geometry, &mut |x, y| {
        let env = envelope.get_or_insert([x, y, x, y]);
        env[0] = env[0].min(x);
        env[1] = env[1].min(y);
        env[2] = env[2].max(x);
        env[3] = env[3].max(y);
    });
    envelope
}

/// Visit every `[x, y, ...]` position of a geometry
pub fn visit_positions(geometry: &Value, visit: &mut impl FnMut(f64, f64)) {
    if let Some(members) = geometry.get("geometries").and_then(Value::as_array) {
        for member in members {
            visit_positions(member, visit);
        }
        return;
    }
    if let Some(coordinates) = geometry.get("coordinates") {
        visit_coordinates(coordinates, visit);
    }
}

fn visit_coordinates(value: &Value, visit: &mut impl FnMut(f64, f64)) {
    let Some(items) = value.as_array() else {
        return;
    };
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => visit(x, y),
        _ => {
            for item in items {
                visit_coordinates(item, visit);
            }
        }
    }
}

/// Rewrite every position of a geometry in place
pub fn map_positions(geometry: &mut Value, map: &impl Fn(f64, f64) -> anyhow::Result<(f64, f64)>) -> anyhow::Result<()> {
    if let Some(members) = geometry.get_mut("geometries").and_then(Value::as_array_mut) {
        for member in members {
            map_positions(member, map)?;
        }
        return Ok(());
    }
    if let Some(coordinates) = geometry.get_mut("coordinates") {
        map_coordinates(coordinates, map)?;
    }
    Ok(())
}

fn map_coordinates(value: &mut Value, map: &impl Fn(f64, f64) -> anyhow::Result<(f64, f64)>) -> anyhow::Result<()> {
    let Some(items) = value.as_array_mut() else {
        return Ok(());
    };
    if let (Some(x), Some(y)) = (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        let (nx, ny) = map(x, y)?;
        items[0] = json!(nx);
        items[1] = json!(ny);
        return Ok(());
    }
    for item in items {
        map_coordinates(item, map)?;
    }
    Ok(())
}

fn short_json(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > 64 {
        format!("{}...", &text[..text.char_indices().nth(64).map(|(i, _)| i).unwrap_or(text.len())])
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crs_normalization() {
        assert_eq!(Crs::parse("epsg:25830").as_str(), "EPSG:25830");
        assert_eq!(Crs::parse("4326"), Crs::wgs84());
        assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG::3857").epsg(), Some(3857));
        assert_eq!(Crs::parse("+proj=longlat").epsg(), None);
    }

    #[test]
    fn envelope_of_polygon() {
        let geometry = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [4.0, 0.0], [4.0, 2.0], [0.0, 0.0]]]
        });
        assert_eq!(geometry_envelope(&geometry), Some([0.0, 0.0, 4.0, 2.0]));
        assert_eq!(geometry_envelope(&json!(null)), None);
    }

    #[test]
    fn feature_conversion_keeps_id_and_properties() {
        let feature = json!({
            "type": "Feature",
            "id": 7,
            "properties": {"name": "a"},
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}
        });
        let record = VectorRecord::from_feature(&feature, &Crs::wgs84()).unwrap();
        assert_eq!(record.fid, Some(7));
        assert_eq!(record.to_feature(), feature);
        assert!(VectorRecord::from_feature(&json!({"type": "Point"}), &Crs::wgs84()).is_err());
    }
}
