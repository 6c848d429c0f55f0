/// Built-in filters
///
/// Every filter here is lazy except `FeatureCache`, which keeps what it streamed so
/// later passes replay it instead of pulling upstream again.
use crate::pipeline::registry::ModuleRegistry;
use crate::pipeline::types::{Capability, DataType, ModuleDescriptor, ParamDef, StageParams};
use crate::runtime::payload::{geometry_envelope, map_positions, Crs, PayloadItem};
use crate::runtime::stage::{factory, Filter, StageContext, StageImpl};
use crate::runtime::stream::{concat, from_items, stream, RecordStream};
use crate::stages::projection::Projection;
use crate::stages::readers::{declared_crs, features_of};
use anyhow::Result;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Register the filter stage types under `backend`
pub(crate) fn register(registry: &ModuleRegistry, backend: &str) {
    registry.register(
        backend,
        ModuleDescriptor::new(
            "ConnectionJoin",
            Capability::Filter,
            "Graph",
            "Joins the streams of data of several input Modules in one unique output.",
        )
        .param(ParamDef::new(
            "stages",
            DataType::Stages,
            "Collection of Modules (Using the \"StageId\" attribute) to merge.",
        )),
        factory(|_| Ok(StageImpl::Filter(Box::new(ConnectionJoin)))),
    );

    registry.register(
        backend,
        ModuleDescriptor::new(
            "FeatureCache",
            Capability::Filter,
            "Feature",
            "Caches data of inputs to speedup the management of repetitive invocations of Modules.",
        ),
        factory(|_| Ok(StageImpl::Filter(Box::new(FeatureCache::default())))),
    );

    registry.register(
        backend,
        ModuleDescriptor::new(
            "FeatureLimit",
            Capability::Filter,
            "Feature",
            "Validates that input Geometries do not be greater than a Limit.",
        )
        .param(ParamDef::new("countLimit", DataType::Int, "Maximum number of input Geometries (Optional).")),
        factory(|params| Ok(StageImpl::Filter(Box::new(FeatureLimit::from_params(params)?)))),
    );

    registry.register(
        backend,
        ModuleDescriptor::new(
            "FeatureResetID",
            Capability::Filter,
            "Feature",
            "Resets the identifier (FID) of each input Feature.",
        ),
        factory(|_| Ok(StageImpl::Filter(Box::new(FeatureResetID)))),
    );

    registry.register(
        backend,
        ModuleDescriptor::new(
            "GeometryTransform",
            Capability::Filter,
            "Geometry",
            "Transforms input Geometries or Rasters between two Spatial Reference Systems (CRS).",
        )
        .param(ParamDef::new(
            "sourceCrs",
            DataType::Crs,
            "Source CRS. It uses input CRS when this param is not specified.",
        ))
        .param(ParamDef::new("targetCrs", DataType::Crs, "Output CRS.").with_options(["EPSG:4326", "EPSG:3857", "EPSG:25830", "EPSG:32630"])),
        factory(|params| Ok(StageImpl::Filter(Box::new(GeometryTransform::from_params(params)?)))),
    );

    registry.register(
        backend,
        ModuleDescriptor::new(
            "SpatialRelation",
            Capability::Filter,
            "Geometry",
            "Returns input Features that match a Spatial Relationship with one or more other Geometries.",
        )
        .param(
            ParamDef::new("relationship", DataType::Str, "Spatial Relationship to validate, 'Intersects' by default.")
                .with_default("Intersects")
                .with_options(["Intersects", "Disjoint"]),
        )
        .param(ParamDef::new(
            "otherGeometries",
            DataType::Input,
            "Collection of Geometries with which input Features should validate a Spatial Relationship.",
        )),
        factory(|params| Ok(StageImpl::Filter(Box::new(SpatialRelation::from_params(params)?)))),
    );
}

/// Concatenates its inputs in the listed order.
///
/// The first item of every input is pulled up front; the ordered union of their
/// attribute names is the output schema. Every item whose attribute set differs from
/// it, including later items of an otherwise uniform input, is projected onto it:
/// missing attributes become null and unknown ones are dropped.
#[derive(Debug)]
pub struct ConnectionJoin;

impl Filter for ConnectionJoin {
    fn consume(&self, inputs: Vec<RecordStream>, ctx: &StageContext) -> Result<RecordStream> {
        let mut heads = Vec::with_capacity(inputs.len());
        let mut fields: Vec<String> = Vec::new();

        for mut input in inputs {
            let head = input.next();
            if let Some(attributes) = head.as_ref().and_then(|h| h.as_ref().ok()).and_then(PayloadItem::attributes) {
                for name in attributes.keys() {
                    if !fields.contains(name) {
                        fields.push(name.clone());
                    }
                }
            }
            heads.push((head, input));
        }

        let merged = concat(
            heads
                .into_iter()
                .map(|(head, rest)| stream(head.into_iter().chain(rest)))
                .collect(),
        );
        if fields.is_empty() {
            return Ok(merged);
        }
        tracing::debug!("🔀 Join '{}' emits {} field(s)", ctx.stage_id, fields.len());

        let schema: BTreeSet<String> = fields.iter().cloned().collect();
        let project = move |attributes: &mut Map<String, Value>| {
            let conforms = attributes.len() == schema.len() && attributes.keys().all(|k| schema.contains(k));
            if !conforms {
                *attributes = fields
                    .iter()
                    .map(|f| (f.clone(), attributes.get(f).cloned().unwrap_or(Value::Null)))
                    .collect();
            }
        };

        Ok(stream(merged.map(move |item| {
            item.map(|mut item| {
                match &mut item {
                    PayloadItem::Vector(record) => project(&mut record.properties),
                    PayloadItem::Table(row) => project(&mut row.fields),
                    PayloadItem::Raster(_) => {}
                }
                item
            })
        })))
    }
}

/// Replays the first complete pass over its input
///
/// The stage is re-invoked once per consumer. The first invocation pulls upstream and
/// buffers what it forwards; only a pass that reached the end without an error is
/// stored. Later invocations replay the stored items and drop their inputs without
/// pulling them. A pass abandoned half-way stores nothing.
#[derive(Debug, Default)]
pub struct FeatureCache {
    cache: Arc<Mutex<Option<Arc<[PayloadItem]>>>>,
}

impl Filter for FeatureCache {
    fn consume(&self, inputs: Vec<RecordStream>, ctx: &StageContext) -> Result<RecordStream> {
        if let Some(items) = self.cache.lock().clone() {
            tracing::debug!("📦 Cache '{}' replays {} item(s)", ctx.stage_id, items.len());
            return Ok(from_items(items.to_vec()));
        }

        let cache = Arc::clone(&self.cache);
        let mut buffer = Vec::new();
        let mut failed = false;
        let mut stored = false;
        let mut input = concat(inputs);

        Ok(stream(std::iter::from_fn(move || match input.next() {
            Some(Ok(item)) => {
                buffer.push(item.clone());
                Some(Ok(item))
            }
            Some(Err(e)) => {
                failed = true;
                Some(Err(e))
            }
            None => {
                if !failed && !stored {
                    stored = true;
                    *cache.lock() = Some(Arc::from(std::mem::take(&mut buffer)));
                }
                None
            }
        })))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureLimitConfig {
    #[serde(default)]
    count_limit: Option<u64>,
}

/// Fails once more items than `countLimit` arrive
///
/// Items up to the limit are forwarded as they come, so downstream stages may have
/// seen them before the failure. A missing or zero limit disables the check.
#[derive(Debug)]
pub struct FeatureLimit {
    count_limit: Option<u64>,
}

impl FeatureLimit {
    fn from_params(params: &StageParams) -> Result<Self> {
        let config: FeatureLimitConfig = params.parse()?;
        Ok(Self {
            count_limit: config.count_limit.filter(|&limit| limit > 0),
        })
    }
}

impl Filter for FeatureLimit {
    fn consume(&self, inputs: Vec<RecordStream>, _ctx: &StageContext) -> Result<RecordStream> {
        let input = concat(inputs);
        let Some(limit) = self.count_limit else {
            return Ok(input);
        };

        let mut count = 0u64;
        Ok(stream(input.map(move |item| -> Result<PayloadItem> {
            let item = item?;
            count += 1;
            if count > limit {
                anyhow::bail!("The number of input Features is greater than maximum allowed ({})", limit);
            }
            Ok(item)
        })))
    }
}

/// Clears the FID of every vector item
#[derive(Debug)]
pub struct FeatureResetID;

impl Filter for FeatureResetID {
    fn consume(&self, inputs: Vec<RecordStream>, _ctx: &StageContext) -> Result<RecordStream> {
        Ok(stream(concat(inputs).map(|item| {
            item.map(|mut item| {
                if let PayloadItem::Vector(record) = &mut item {
                    record.fid = None;
                }
                item
            })
        })))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeometryTransformConfig {
    #[serde(default)]
    source_crs: Option<String>,
    target_crs: String,
}

/// Reprojects vector geometries between the CRSs `Projection` knows
///
/// Without `sourceCrs` every record is transformed from its own CRS, so an unsupported
/// input CRS surfaces as a stage failure on that record.
#[derive(Debug)]
pub struct GeometryTransform {
    source: Option<Crs>,
    target: Crs,
}

impl GeometryTransform {
    fn from_params(params: &StageParams) -> Result<Self> {
        let config: GeometryTransformConfig = params.parse()?;
        let source = config.source_crs.as_deref().map(Crs::parse);
        let target = Crs::parse(&config.target_crs);

        match &source {
            Some(source) => {
                transform_between(source, &target)?;
            }
            None if Projection::of(&target).is_none() => anyhow::bail!("unsupported target CRS {}", target),
            None => {}
        }
        Ok(Self { source, target })
    }
}

/// Position transform between two CRSs, through geographic coordinates
fn transform_between(source: &Crs, target: &Crs) -> Result<impl Fn(f64, f64) -> Result<(f64, f64)>> {
    let identity = source == target;
    let (from, to) = match (Projection::of(source), Projection::of(target)) {
        (Some(from), Some(to)) => (from, to),
        _ if identity => (Projection::Geographic, Projection::Geographic),
        _ => anyhow::bail!("unsupported CRS transform {} -> {}", source, target),
    };
    Ok(move |x: f64, y: f64| {
        if identity {
            return Ok((x, y));
        }
        let (lon, lat) = from.unproject(x, y)?;
        to.project(lon, lat)
    })
}

impl Filter for GeometryTransform {
    fn consume(&self, inputs: Vec<RecordStream>, _ctx: &StageContext) -> Result<RecordStream> {
        let source = self.source.clone();
        let target = self.target.clone();

        Ok(stream(concat(inputs).map(move |item| -> Result<PayloadItem> {
            let mut item = item?;
            match &mut item {
                PayloadItem::Vector(record) => {
                    let from = source.clone().unwrap_or_else(|| record.crs.clone());
                    let transform = transform_between(&from, &target)?;
                    map_positions(&mut record.geometry, &transform)?;
                    record.crs = target.clone();
                }
                PayloadItem::Raster(_) => anyhow::bail!("raster reprojection is not supported"),
                PayloadItem::Table(_) => {}
            }
            Ok(item)
        })))
    }
}

/// Envelope-based spatial predicate
///
/// Both sides are compared by bounding box only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Relationship {
    Intersects,
    Disjoint,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpatialRelationConfig {
    #[serde(default = "default_relationship")]
    relationship: Relationship,
    #[serde(default)]
    other_geometries: Option<Value>,
}

fn default_relationship() -> Relationship {
    Relationship::Intersects
}

/// Keeps the items whose envelope matches the relationship with any other geometry.
///
/// `otherGeometries` is either an auxiliary stage reference, literal GeoJSON, or a
/// `$(key)` token naming the parameter that holds the literal value.
#[derive(Debug)]
pub struct SpatialRelation {
    relationship: Relationship,
    literal: Option<Value>,
}

impl SpatialRelation {
    fn from_params(params: &StageParams) -> Result<Self> {
        let config: SpatialRelationConfig = params.parse()?;

        let literal = match config.other_geometries {
            Some(Value::String(token)) if token.starts_with("$(") && token.ends_with(')') => {
                let key = &token[2..token.len() - 1];
                Some(
                    params
                        .get(key)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("no value supplied for '{}'", key))?,
                )
            }
            other => other,
        };
        Ok(Self {
            relationship: config.relationship,
            literal,
        })
    }

    /// Envelopes to test against, with the CRS they are expressed in.
    ///
    /// Auxiliary stage output wins over the literal value.
    fn other_envelopes(&self, ctx: &StageContext) -> Result<(Option<Crs>, Vec<[f64; 4]>)> {
        if let Some(items) = ctx.auxiliary("otherGeometries") {
            let crs = items.first().and_then(PayloadItem::crs).cloned();
            let envelopes = items
                .iter()
                .filter_map(PayloadItem::as_vector)
                .filter_map(|r| r.envelope())
                .collect();
            return Ok((crs, envelopes));
        }

        match &self.literal {
            Some(value @ Value::Object(_)) | Some(value @ Value::Array(_)) => {
                let crs = declared_crs(value);
                let records = features_of(value, &crs.clone().unwrap_or_else(Crs::wgs84))?;
                Ok((crs, records.iter().filter_map(|r| r.envelope()).collect()))
            }
            Some(other) => anyhow::bail!("otherGeometries does not name stages nor hold GeoJSON: {}", other),
            None => anyhow::bail!("otherGeometries is required"),
        }
    }
}

/// Closed boxes: touching edges intersect
fn envelopes_intersect(a: &[f64; 4], b: &[f64; 4]) -> bool {
    a[0] <= b[2] && a[2] >= b[0] && a[1] <= b[3] && a[3] >= b[1]
}

impl Filter for SpatialRelation {
    fn consume(&self, inputs: Vec<RecordStream>, ctx: &StageContext) -> Result<RecordStream> {
        let (other_crs, others) = self.other_envelopes(ctx)?;
        let relationship = self.relationship;
        tracing::debug!("🧭 '{}' tests {:?} against {} geometries", ctx.stage_id, relationship, others.len());

        Ok(stream(concat(inputs).filter_map(move |item| {
            let item = match item {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };
            let Some(record) = item.as_vector() else {
                return Some(Ok(item));
            };
            if let Some(crs) = &other_crs {
                if *crs != record.crs {
                    return Some(Err(anyhow::anyhow!(
                        "otherGeometries use {} but input features use {}",
                        crs,
                        record.crs
                    )));
                }
            }

            let intersects = geometry_envelope(&record.geometry)
                .map(|env| others.iter().any(|o| envelopes_intersect(&env, o)))
                .unwrap_or(false);
            let keep = match relationship {
                Relationship::Intersects => intersects,
                Relationship::Disjoint => !intersects,
            };
            keep.then_some(Ok(item))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::payload::{TableRow, VectorRecord};
    use serde_json::json;
    use std::collections::HashMap;

    fn point(x: f64, y: f64, properties: Value) -> PayloadItem {
        PayloadItem::Vector(VectorRecord::new(
            json!({"type": "Point", "coordinates": [x, y]}),
            properties.as_object().cloned().unwrap_or_default(),
            Crs::wgs84(),
        ))
    }

    fn input(items: Vec<PayloadItem>) -> RecordStream {
        from_items(items)
    }

    fn params(values: Value) -> StageParams {
        StageParams::new("stage", values.as_object().cloned().unwrap_or_default())
    }

    fn drain(stream: RecordStream) -> Result<Vec<PayloadItem>> {
        stream.collect()
    }

    #[test]
    fn join_keeps_listed_order_and_fills_missing_fields() {
        let ctx = StageContext::new("join");
        let joined = ConnectionJoin
            .consume(
                vec![
                    input(vec![point(0.0, 0.0, json!({"a": 1}))]),
                    input(vec![point(1.0, 1.0, json!({"b": 2})), point(2.0, 2.0, json!({"b": 3}))]),
                ],
                &ctx,
            )
            .unwrap();
        let items = drain(joined).unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].attributes().unwrap(), json!({"a": 1, "b": null}).as_object().unwrap());
        assert_eq!(items[2].attributes().unwrap(), json!({"a": null, "b": 3}).as_object().unwrap());
    }

    #[test]
    fn join_of_homogeneous_inputs_is_untouched() {
        let ctx = StageContext::new("join");
        let joined = ConnectionJoin
            .consume(
                vec![input(vec![point(0.0, 0.0, json!({"a": 1}))]), input(vec![]), input(vec![point(1.0, 1.0, json!({"a": 2}))])],
                &ctx,
            )
            .unwrap();
        let items = drain(joined).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].attributes().unwrap(), json!({"a": 2}).as_object().unwrap());
    }

    #[test]
    fn join_normalizes_items_after_the_first_one() {
        let ctx = StageContext::new("join");
        let joined = ConnectionJoin
            .consume(
                vec![
                    input(vec![point(0.0, 0.0, json!({"a": 1})), point(1.0, 1.0, json!({"a": 2, "z": true}))]),
                    input(vec![point(2.0, 2.0, json!({"a": 3})), point(3.0, 3.0, json!({}))]),
                ],
                &ctx,
            )
            .unwrap();
        let items = drain(joined).unwrap();

        assert_eq!(items.len(), 4);
        assert_eq!(items[1].attributes().unwrap(), json!({"a": 2}).as_object().unwrap());
        assert_eq!(items[3].attributes().unwrap(), json!({"a": null}).as_object().unwrap());
    }

    #[test]
    fn cache_replays_after_a_complete_pass() {
        let cache = FeatureCache::default();
        let ctx = StageContext::new("cache");

        let first = drain(cache.consume(vec![input(vec![point(0.0, 0.0, json!({}))])], &ctx).unwrap()).unwrap();
        // Upstream is not pulled again on the next pass
        let failing: RecordStream = stream(std::iter::once(Err(anyhow::anyhow!("upstream re-read"))));
        let second = drain(cache.consume(vec![failing], &ctx).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn limit_fails_when_exceeded() {
        let limit = FeatureLimit::from_params(&params(json!({"countLimit": 1}))).unwrap();
        let ctx = StageContext::new("limit");
        let ok = drain(limit.consume(vec![input(vec![point(0.0, 0.0, json!({}))])], &ctx).unwrap());
        assert!(ok.is_ok());

        let too_many = input(vec![point(0.0, 0.0, json!({})), point(1.0, 1.0, json!({}))]);
        let err = drain(limit.consume(vec![too_many], &ctx).unwrap()).unwrap_err();
        assert!(err.to_string().contains("maximum allowed (1)"));
    }

    #[test]
    fn reset_id_clears_fids() {
        let mut item = point(0.0, 0.0, json!({}));
        if let PayloadItem::Vector(record) = &mut item {
            record.fid = Some(9);
        }
        let items = drain(FeatureResetID.consume(vec![input(vec![item])], &StageContext::new("reset")).unwrap()).unwrap();
        assert_eq!(items[0].as_vector().unwrap().fid, None);
    }

    #[test]
    fn transform_round_trips_through_mercator() {
        let forward = GeometryTransform::from_params(&params(json!({"sourceCrs": "EPSG:4326", "targetCrs": "EPSG:3857"}))).unwrap();
        let inverse = GeometryTransform::from_params(&params(json!({"targetCrs": "EPSG:4326"}))).unwrap();
        let ctx = StageContext::new("transform");

        let projected = forward.consume(vec![input(vec![point(10.0, 45.0, json!({}))])], &ctx).unwrap();
        let projected = drain(projected).unwrap();
        let record = projected[0].as_vector().unwrap();
        assert_eq!(record.crs, Crs::parse("EPSG:3857"));
        let x = record.geometry["coordinates"][0].as_f64().unwrap();
        assert!((x - 1_113_194.907_932_736).abs() < 1e-3);

        let back = drain(inverse.consume(vec![input(projected)], &ctx).unwrap()).unwrap();
        let coordinates = &back[0].as_vector().unwrap().geometry["coordinates"];
        assert!((coordinates[0].as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert!((coordinates[1].as_f64().unwrap() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn transform_rejects_unsupported_crs_and_polar_points() {
        assert!(GeometryTransform::from_params(&params(json!({"sourceCrs": "EPSG:4326", "targetCrs": "EPSG:2154"}))).is_err());
        assert!(GeometryTransform::from_params(&params(json!({"targetCrs": "EPSG:2154"}))).is_err());

        let forward = GeometryTransform::from_params(&params(json!({"targetCrs": "EPSG:3857"}))).unwrap();
        let polar = input(vec![point(0.0, 89.9, json!({}))]);
        assert!(drain(forward.consume(vec![polar], &StageContext::new("t")).unwrap()).is_err());

        let rows = input(vec![PayloadItem::Table(TableRow::default())]);
        assert_eq!(drain(forward.consume(vec![rows], &StageContext::new("t")).unwrap()).unwrap().len(), 1);
    }

    #[test]
    fn transform_projects_between_utm_and_web_mercator() {
        let to_utm = GeometryTransform::from_params(&params(json!({"targetCrs": "EPSG:25830"}))).unwrap();
        let to_mercator = GeometryTransform::from_params(&params(json!({"targetCrs": "EPSG:3857"}))).unwrap();
        let ctx = StageContext::new("transform");

        let projected = drain(to_utm.consume(vec![input(vec![point(-3.7038, 40.4168, json!({}))])], &ctx).unwrap()).unwrap();
        let record = projected[0].as_vector().unwrap();
        assert_eq!(record.crs, Crs::parse("EPSG:25830"));
        let easting = record.geometry["coordinates"][0].as_f64().unwrap();
        assert!((easting - 440_290.458).abs() < 0.01, "{}", easting);

        let mercator = drain(to_mercator.consume(vec![input(projected)], &ctx).unwrap()).unwrap();
        let x = mercator[0].as_vector().unwrap().geometry["coordinates"][0].as_f64().unwrap();
        assert!((x - (-412_305.130)).abs() < 0.01, "{}", x);
    }

    #[test]
    fn spatial_relation_uses_auxiliary_geometries() {
        let relation = SpatialRelation::from_params(&params(json!({"otherGeometries": "clip"}))).unwrap();
        let clip: Arc<[PayloadItem]> = Arc::from(vec![PayloadItem::Vector(VectorRecord::new(
            json!({"type": "Polygon", "coordinates": [[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 0.0]]]}),
            Map::new(),
            Crs::wgs84(),
        ))]);
        let ctx = StageContext {
            stage_id: "relate".into(),
            auxiliary: HashMap::from([("otherGeometries".to_string(), clip)]),
        };

        let items = input(vec![point(1.0, 1.0, json!({"in": true})), point(5.0, 5.0, json!({"in": false}))]);
        let kept = drain(relation.consume(vec![items], &ctx).unwrap()).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].attributes().unwrap()["in"], json!(true));
    }

    #[test]
    fn spatial_relation_picks_alternative_literal() {
        let relation = SpatialRelation::from_params(&params(json!({
            "relationship": "Disjoint",
            "otherGeometries": "$(otherGeometries_geojson)",
            "otherGeometries_geojson": {"type": "Point", "coordinates": [1.0, 1.0]}
        })))
        .unwrap();

        let items = input(vec![point(1.0, 1.0, json!({})), point(5.0, 5.0, json!({}))]);
        let kept = drain(relation.consume(vec![items], &StageContext::new("relate")).unwrap()).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].as_vector().unwrap().geometry["coordinates"], json!([5.0, 5.0]));

        assert!(SpatialRelation::from_params(&params(json!({"otherGeometries": "$(missing)"}))).is_err());
    }
}
